//! spotwarden-engine — the per-cycle decision pipeline.
//!
//! Given the instance, its usage, a pricing snapshot, forecasts, and an
//! immutable `EngineConfig`, produces exactly one `Decision`. The pipeline
//! is pure and synchronous; everything it needs is fetched beforehand.
//!
//! # Pipeline
//!
//! ```text
//! 1. discover      family pools, dedup by (region, az, type), drop stale
//! 2. price filter  price <= current * 1.1 and discount >= baseline - 2*margin
//! 3. forecast      attach predicted price / discount / volatility
//! 4. classify      OVER_PROVISIONED | UNDER_PROVISIONED | RIGHT_SIZED
//! 5. baseline      is the current pool still fine an hour from now?
//! 6. usage rules   shape constraints per usage class
//! 7. improvement   discount gain AND risk improvement, both required
//! 8. select        first matching rule: stay, switch, fallback, stay
//! ```
//!
//! Every comparison is recorded as a `ThresholdCheck` in the decision
//! metadata so the outcome can be explained without re-running anything.

pub mod catalog;
pub mod engine;
pub mod filters;
pub mod forecast;
pub mod policy;
pub mod usage;

pub use catalog::{Catalog, discover_pools};
pub use engine::{DecisionInput, decide, forecast_targets};
pub use forecast::{Predictions, attach_forecast};
pub use policy::{SELECTION_ORDER, Selection, SelectionContext, SelectionRule};
pub use usage::classify_usage;
