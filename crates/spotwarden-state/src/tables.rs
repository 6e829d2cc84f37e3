//! redb table definitions for the spotwarden state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized).
//! Audit tables are keyed `{workload_id}:{seq:020}` and are never rewritten.

use redb::TableDefinition;

/// Instance arena keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Replicas keyed by replica id.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Per-workload cooldown / breaker / review state keyed by workload id.
pub const CONTROLS: TableDefinition<&str, &[u8]> = TableDefinition::new("controls");

/// Decisions keyed by `{workload_id}:{seq}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Switch events keyed by `{workload_id}:{seq}`.
pub const SWITCH_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("switch_events");

/// Interruption events keyed by `{workload_id}:{seq}`.
pub const INTERRUPTION_EVENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("interruption_events");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in `META` holding the last audit sequence number.
pub const AUDIT_SEQ: &str = "audit_seq";
