//! spotwarden-state — embedded state store for spotwarden.
//!
//! Backed by [redb](https://docs.rs/redb), holds the instance arena, the
//! replica table, per-workload control records, and the append-only audit
//! log (decisions, switch events, interruption events).
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Audit keys are `{workload_id}:{seq:020}` where `seq` is a store-wide
//! counter advanced in the same write transaction as the insert, so a
//! prefix scan yields a workload's history in append order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
