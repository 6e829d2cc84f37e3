//! spotwarden-core — shared domain types and configuration.
//!
//! Everything that crosses a crate boundary lives here: the instance
//! arena records, pool identities and price samples, the append-only audit
//! records (`Decision`, `SwitchEvent`, `InterruptionEvent`), replicas, and
//! the `spotwarden.toml` configuration surface.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, DaemonConfig, EngineConfig, HeuristicConfig, ReplicaConfig, SafetyConfig,
    SpotwardenConfig,
};
pub use types::*;
