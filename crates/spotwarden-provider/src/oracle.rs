//! The price forecast oracle seam.

use std::future::Future;
use std::pin::Pin;

use spotwarden_core::{Forecast, PoolKey};

use crate::error::ForecastError;

pub type OracleFuture<'a> = Pin<Box<dyn Future<Output = Result<Forecast, ForecastError>> + Send + 'a>>;

/// Forecasts a pool's price one hour after `at`.
pub trait PriceOracle: Send + Sync {
    fn predict<'a>(&'a self, pool: &'a PoolKey, at: u64, recent_prices: &'a [f64]) -> OracleFuture<'a>;
}
