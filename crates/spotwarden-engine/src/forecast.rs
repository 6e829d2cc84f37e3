//! Stage 3: attach one-hour-ahead metrics to a pool.
//!
//! With an oracle forecast the predicted price is taken as-is. Without one
//! the mean of the recent observed prices stands in (current price if there
//! is no history) with confidence 0.
//!
//! Predicted volatility is the coefficient of variation of the recent
//! prices plus the current and predicted price, scaled by
//! `2 - confidence`, so a low-confidence forecast reads as riskier.

use std::collections::HashMap;

use spotwarden_core::{Forecast, ForecastSource, PoolKey, PoolPrice, PoolView, discount};

/// Oracle forecasts for the cycle, keyed by pool. A missing entry means the
/// oracle could not forecast that pool.
pub type Predictions = HashMap<PoolKey, Forecast>;

pub fn attach_forecast(pool: &PoolPrice, forecast: Option<&Forecast>) -> PoolView {
    let (predicted_price, confidence, source) = match forecast {
        Some(f) => (f.predicted_price, f.confidence.clamp(0.0, 1.0), ForecastSource::Oracle),
        None => (fallback_price(pool), 0.0, ForecastSource::Fallback),
    };

    let mut series = pool.recent_prices.clone();
    series.push(pool.spot_price);
    series.push(predicted_price);
    let predicted_volatility = coefficient_of_variation(&series) * (2.0 - confidence);

    PoolView {
        key: pool.key.clone(),
        shape: pool.shape,
        current_price: pool.spot_price,
        on_demand_price: pool.on_demand_price,
        discount: pool.discount(),
        predicted_price_1h: predicted_price,
        predicted_discount: discount(predicted_price, pool.on_demand_price),
        predicted_volatility,
        forecast_source: source,
    }
}

fn fallback_price(pool: &PoolPrice) -> f64 {
    if pool.recent_prices.is_empty() {
        return pool.spot_price;
    }
    pool.recent_prices.iter().sum::<f64>() / pool.recent_prices.len() as f64
}

fn coefficient_of_variation(series: &[f64]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = series.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotwarden_core::InstanceShape;

    fn pool(spot: f64, recent: Vec<f64>) -> PoolPrice {
        PoolPrice {
            key: PoolKey::new("us-east-1", "us-east-1a", "m5.large"),
            shape: InstanceShape {
                vcpus: 2,
                memory_mib: 8192,
            },
            spot_price: spot,
            on_demand_price: 0.1,
            observed_at: 0,
            recent_prices: recent,
            interruption_rate: 0.0,
        }
    }

    #[test]
    fn oracle_forecast_drives_predicted_discount() {
        let view = attach_forecast(
            &pool(0.03, vec![0.03, 0.03]),
            Some(&Forecast {
                predicted_price: 0.02,
                confidence: 1.0,
            }),
        );
        assert_eq!(view.forecast_source, ForecastSource::Oracle);
        assert!((view.predicted_discount - 0.8).abs() < 1e-9);
        assert!((view.discount - 0.7).abs() < 1e-9);
    }

    #[test]
    fn fallback_uses_recent_average() {
        let view = attach_forecast(&pool(0.04, vec![0.02, 0.04]), None);
        assert_eq!(view.forecast_source, ForecastSource::Fallback);
        assert!((view.predicted_price_1h - 0.03).abs() < 1e-9);
    }

    #[test]
    fn fallback_without_history_uses_current_price() {
        let view = attach_forecast(&pool(0.04, Vec::new()), None);
        assert_eq!(view.predicted_price_1h, 0.04);
        assert_eq!(view.predicted_volatility, 0.0);
    }

    #[test]
    fn flat_prices_have_zero_volatility() {
        let view = attach_forecast(
            &pool(0.03, vec![0.03, 0.03, 0.03]),
            Some(&Forecast {
                predicted_price: 0.03,
                confidence: 0.5,
            }),
        );
        assert_eq!(view.predicted_volatility, 0.0);
    }

    #[test]
    fn low_confidence_reads_as_riskier() {
        let p = pool(0.03, vec![0.02, 0.04, 0.03]);
        let confident = attach_forecast(
            &p,
            Some(&Forecast {
                predicted_price: 0.03,
                confidence: 1.0,
            }),
        );
        let unsure = attach_forecast(
            &p,
            Some(&Forecast {
                predicted_price: 0.03,
                confidence: 0.0,
            }),
        );
        assert!(unsure.predicted_volatility > confident.predicted_volatility);
    }
}
