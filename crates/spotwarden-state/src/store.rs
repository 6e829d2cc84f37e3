//! StateStore — redb-backed persistence for spotwarden.
//!
//! Provides typed CRUD over the instance arena, replicas, and workload
//! control records, plus append/list access to the audit tables. The
//! audit tables have no update or delete path. The store supports both
//! on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use spotwarden_core::{Decision, Instance, InterruptionEvent, Replica, SwitchEvent};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            INSTANCES,
            REPLICAS,
            CONTROLS,
            DECISIONS,
            SWITCH_EVENTS,
            INTERRUPTION_EVENTS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_record<T: Serialize>(&self, table: RecordTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping records whose key starts with `prefix`.
    fn list_records<T: DeserializeOwned>(&self, table: RecordTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Append an audit record under the next store-wide sequence number.
    fn append<T: Serialize>(&self, table: RecordTable, workload_id: &str, record: &T) -> StateResult<u64> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let last = meta
                .get(AUDIT_SEQ)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            seq = last + 1;
            meta.insert(AUDIT_SEQ, seq).map_err(map_err!(Write))?;

            let key = audit_key(workload_id, seq);
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    ///
    /// Fails with `PrimaryConflict` if the write would leave the workload
    /// with two live primaries.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            if instance.is_live_primary() {
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, existing) = entry.map_err(map_err!(Read))?;
                    let existing: Instance = serde_json::from_slice(existing.value())
                        .map_err(map_err!(Deserialize))?;
                    if existing.id != instance.id
                        && existing.workload_id == instance.workload_id
                        && existing.is_live_primary()
                    {
                        return Err(StateError::PrimaryConflict {
                            workload_id: instance.workload_id.clone(),
                            existing: existing.id,
                        });
                    }
                }
            }
            table
                .insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %instance.id, role = ?instance.role, status = %instance.status, "instance stored");
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_record(INSTANCES, id)
    }

    /// Get an instance or fail with `NotFound`.
    pub fn require_instance(&self, id: &str) -> StateResult<Instance> {
        self.get_instance(id)?
            .ok_or_else(|| StateError::NotFound(format!("instance {id}")))
    }

    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.list_records(INSTANCES, "")
    }

    pub fn list_instances_for_workload(&self, workload_id: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.workload_id == workload_id)
            .collect())
    }

    /// The workload's single live primary, if any.
    pub fn live_primary(&self, workload_id: &str) -> StateResult<Option<Instance>> {
        Ok(self
            .list_instances_for_workload(workload_id)?
            .into_iter()
            .find(Instance::is_live_primary))
    }

    // ── Replicas ───────────────────────────────────────────────────

    pub fn put_replica(&self, replica: &Replica) -> StateResult<()> {
        self.put_record(REPLICAS, &replica.id, replica)?;
        debug!(replica = %replica.id, status = %replica.status, "replica stored");
        Ok(())
    }

    pub fn get_replica(&self, id: &str) -> StateResult<Option<Replica>> {
        self.get_record(REPLICAS, id)
    }

    pub fn require_replica(&self, id: &str) -> StateResult<Replica> {
        self.get_replica(id)?
            .ok_or_else(|| StateError::NotFound(format!("replica {id}")))
    }

    /// Insert a new replica unless its parent already has a non-terminal
    /// one. The check and the insert share one write transaction.
    pub fn reserve_replica_slot(&self, replica: &Replica) -> StateResult<()> {
        let value = serde_json::to_vec(replica).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, existing) = entry.map_err(map_err!(Read))?;
                let existing: Replica = serde_json::from_slice(existing.value())
                    .map_err(map_err!(Deserialize))?;
                if existing.id != replica.id
                    && existing.parent_instance_id == replica.parent_instance_id
                    && !existing.status.is_terminal()
                {
                    return Err(StateError::ReplicaSlotOccupied {
                        parent: replica.parent_instance_id.clone(),
                        existing: existing.id,
                    });
                }
            }
            table
                .insert(replica.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(replica = %replica.id, parent = %replica.parent_instance_id, "replica slot reserved");
        Ok(())
    }

    pub fn list_replicas_for_parent(&self, parent_instance_id: &str) -> StateResult<Vec<Replica>> {
        Ok(self
            .list_records::<Replica>(REPLICAS, "")?
            .into_iter()
            .filter(|r| r.parent_instance_id == parent_instance_id)
            .collect())
    }

    pub fn list_replicas_for_workload(&self, workload_id: &str) -> StateResult<Vec<Replica>> {
        Ok(self
            .list_records::<Replica>(REPLICAS, "")?
            .into_iter()
            .filter(|r| r.workload_id == workload_id)
            .collect())
    }

    // ── Workload controls ──────────────────────────────────────────

    pub fn put_control(&self, control: &WorkloadControl) -> StateResult<()> {
        self.put_record(CONTROLS, &control.workload_id, control)
    }

    pub fn get_control(&self, workload_id: &str) -> StateResult<Option<WorkloadControl>> {
        self.get_record(CONTROLS, workload_id)
    }

    /// Read-modify-write a workload's control record inside one write
    /// transaction, starting from a fresh record if none exists. Returns
    /// the stored record and whatever `apply` returned.
    pub fn update_control<R>(
        &self,
        workload_id: &str,
        apply: impl FnOnce(&mut WorkloadControl) -> R,
    ) -> StateResult<(WorkloadControl, R)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut control = {
            let table = txn.open_table(CONTROLS).map_err(map_err!(Table))?;
            let stored = table.get(workload_id).map_err(map_err!(Read))?;
            match stored {
                Some(guard) => serde_json::from_slice::<WorkloadControl>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => WorkloadControl::new(workload_id),
            }
        };
        let out = apply(&mut control);
        let value = serde_json::to_vec(&control).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(CONTROLS).map_err(map_err!(Table))?;
            table
                .insert(workload_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((control, out))
    }

    pub fn list_controls(&self) -> StateResult<Vec<WorkloadControl>> {
        self.list_records(CONTROLS, "")
    }

    // ── Audit log ──────────────────────────────────────────────────

    /// Append a decision. Returns its sequence number.
    pub fn append_decision(&self, decision: &Decision) -> StateResult<u64> {
        let seq = self.append(DECISIONS, &decision.workload_id, decision)?;
        debug!(workload = %decision.workload_id, seq, action = %decision.action, "decision appended");
        Ok(seq)
    }

    /// Decisions for a workload in append order.
    pub fn list_decisions(&self, workload_id: &str) -> StateResult<Vec<Decision>> {
        self.list_records(DECISIONS, &format!("{workload_id}:"))
    }

    pub fn append_switch_event(&self, event: &SwitchEvent) -> StateResult<u64> {
        let seq = self.append(SWITCH_EVENTS, &event.workload_id, event)?;
        debug!(workload = %event.workload_id, seq, success = event.success, "switch event appended");
        Ok(seq)
    }

    pub fn list_switch_events(&self, workload_id: &str) -> StateResult<Vec<SwitchEvent>> {
        self.list_records(SWITCH_EVENTS, &format!("{workload_id}:"))
    }

    pub fn append_interruption_event(&self, event: &InterruptionEvent) -> StateResult<u64> {
        let seq = self.append(INTERRUPTION_EVENTS, &event.workload_id, event)?;
        debug!(
            workload = %event.workload_id,
            seq,
            signal = %event.signal_type,
            response = ?event.response_action,
            "interruption event appended"
        );
        Ok(seq)
    }

    pub fn list_interruption_events(&self, workload_id: &str) -> StateResult<Vec<InterruptionEvent>> {
        self.list_records(INTERRUPTION_EVENTS, &format!("{workload_id}:"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotwarden_core::*;

    fn test_instance(id: &str, workload: &str, role: InstanceRole) -> Instance {
        Instance {
            id: id.to_string(),
            workload_id: workload.to_string(),
            instance_type: "m5.large".to_string(),
            region: "us-east-1".to_string(),
            az: "us-east-1a".to_string(),
            lifecycle: Lifecycle::Spot,
            role,
            status: InstanceStatus::Running,
            created_at: 1000,
            terminated_at: None,
        }
    }

    fn test_decision(workload: &str, action: ActionType) -> Decision {
        Decision {
            id: next_record_id("dec"),
            workload_id: workload.to_string(),
            instance_id: "i-1".to_string(),
            action,
            target_pool: None,
            target_instance_type: None,
            reason: "test".to_string(),
            cooldown_until: None,
            decided_at: 1000,
            dry_run: false,
            success: true,
            metadata: DecisionMetadata::default(),
        }
    }

    fn test_replica(id: &str, parent: &str) -> Replica {
        Replica {
            id: id.to_string(),
            workload_id: "web".to_string(),
            parent_instance_id: parent.to_string(),
            instance_id: None,
            pool: None,
            status: ReplicaStatus::Launching,
            sync_status: SyncStatus::Initializing,
            sync_latency_ms: 0,
            transfer_progress: 0,
            created_by: ReplicaOrigin::Manual,
            urgency: Urgency::Normal,
            created_at: 1000,
            ready_at: None,
            updated_at: 1000,
            failure_reason: None,
        }
    }

    // ── Instance arena ─────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = test_instance("i-1", "web", InstanceRole::Primary);
        store.put_instance(&inst).unwrap();
        assert_eq!(store.get_instance("i-1").unwrap(), Some(inst));
        assert!(store.get_instance("i-404").unwrap().is_none());
    }

    #[test]
    fn second_live_primary_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&test_instance("i-1", "web", InstanceRole::Primary))
            .unwrap();

        let err = store
            .put_instance(&test_instance("i-2", "web", InstanceRole::Primary))
            .unwrap_err();
        assert!(matches!(err, StateError::PrimaryConflict { .. }));

        // A different workload is unaffected.
        store
            .put_instance(&test_instance("i-3", "batch", InstanceRole::Primary))
            .unwrap();
    }

    #[test]
    fn primary_handover_requires_demotion_first() {
        let store = StateStore::open_in_memory().unwrap();
        let mut old = test_instance("i-1", "web", InstanceRole::Primary);
        store.put_instance(&old).unwrap();
        store
            .put_instance(&test_instance("i-2", "web", InstanceRole::Replica))
            .unwrap();

        old.role = InstanceRole::Zombie;
        store.put_instance(&old).unwrap();
        store
            .put_instance(&test_instance("i-2", "web", InstanceRole::Primary))
            .unwrap();

        assert_eq!(store.live_primary("web").unwrap().unwrap().id, "i-2");
    }

    #[test]
    fn terminated_primary_does_not_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        let mut old = test_instance("i-1", "web", InstanceRole::Primary);
        old.mark_terminated(2000);
        store.put_instance(&old).unwrap();
        store
            .put_instance(&test_instance("i-2", "web", InstanceRole::Primary))
            .unwrap();
    }

    // ── Replicas ───────────────────────────────────────────────────

    #[test]
    fn replicas_listed_by_parent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_replica(&test_replica("r-1", "i-1")).unwrap();
        store.put_replica(&test_replica("r-2", "i-1")).unwrap();
        store.put_replica(&test_replica("r-3", "i-9")).unwrap();

        assert_eq!(store.list_replicas_for_parent("i-1").unwrap().len(), 2);
        assert_eq!(store.list_replicas_for_workload("web").unwrap().len(), 3);
        assert!(store.require_replica("r-404").is_err());
    }

    // ── Audit log ──────────────────────────────────────────────────

    #[test]
    fn decisions_listed_in_append_order() {
        let store = StateStore::open_in_memory().unwrap();
        let first = test_decision("web", ActionType::Stay);
        let second = test_decision("web", ActionType::SwitchToSpot);
        let s1 = store.append_decision(&first).unwrap();
        let s2 = store.append_decision(&second).unwrap();
        assert!(s2 > s1);

        let history = store.list_decisions("web").unwrap();
        assert_eq!(history, vec![first, second]);
    }

    #[test]
    fn audit_prefix_does_not_leak_between_workloads() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_decision(&test_decision("web", ActionType::Stay)).unwrap();
        store.append_decision(&test_decision("web2", ActionType::Stay)).unwrap();

        assert_eq!(store.list_decisions("web").unwrap().len(), 1);
        assert_eq!(store.list_decisions("web2").unwrap().len(), 1);
    }

    #[test]
    fn sequence_is_shared_across_audit_tables() {
        let store = StateStore::open_in_memory().unwrap();
        let s1 = store.append_decision(&test_decision("web", ActionType::Stay)).unwrap();
        let s2 = store
            .append_switch_event(&SwitchEvent {
                id: next_record_id("sw"),
                workload_id: "web".to_string(),
                old_instance_id: "i-1".to_string(),
                new_instance_id: Some("i-2".to_string()),
                trigger: SwitchTrigger::Decision,
                reason: "test".to_string(),
                old_price: 0.05,
                new_price: Some(0.04),
                savings_per_hour: 0.01,
                downtime_seconds: 0.0,
                success: true,
                recorded_at: 1000,
            })
            .unwrap();
        assert_eq!(s2, s1 + 1);
    }

    #[test]
    fn control_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let mut control = WorkloadControl::new("web");
        control.breaker_open = true;
        store.put_control(&control).unwrap();
        assert_eq!(store.get_control("web").unwrap(), Some(control));
        assert_eq!(store.list_controls().unwrap().len(), 1);
    }

    #[test]
    fn replica_slot_is_reserved_once_per_parent() {
        let store = StateStore::open_in_memory().unwrap();
        store.reserve_replica_slot(&test_replica("r-1", "i-1")).unwrap();

        let err = store.reserve_replica_slot(&test_replica("r-2", "i-1")).unwrap_err();
        match err {
            StateError::ReplicaSlotOccupied { parent, existing } => {
                assert_eq!(parent, "i-1");
                assert_eq!(existing, "r-1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.get_replica("r-2").unwrap().is_none());

        // Another parent has its own slot.
        store.reserve_replica_slot(&test_replica("r-3", "i-9")).unwrap();

        // A terminal replica frees the slot.
        let mut first = store.require_replica("r-1").unwrap();
        first.status = ReplicaStatus::Terminated;
        store.put_replica(&first).unwrap();
        store.reserve_replica_slot(&test_replica("r-4", "i-1")).unwrap();
    }

    #[test]
    fn concurrent_slot_reservations_admit_one() {
        let store = StateStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .reserve_replica_slot(&test_replica(&format!("r-{n}"), "i-1"))
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(store.list_replicas_for_parent("i-1").unwrap().len(), 1);
    }

    #[test]
    fn control_update_starts_fresh_and_persists() {
        let store = StateStore::open_in_memory().unwrap();
        let (control, previous) = store
            .update_control("web", |c| {
                let previous = c.consecutive_failures;
                c.consecutive_failures += 1;
                previous
            })
            .unwrap();
        assert_eq!(previous, 0);
        assert_eq!(control.workload_id, "web");
        assert_eq!(store.get_control("web").unwrap(), Some(control));
    }

    #[test]
    fn concurrent_control_updates_are_not_lost() {
        let store = StateStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .update_control("web", |c| c.consecutive_failures += 1)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let control = store.get_control("web").unwrap().unwrap();
        assert_eq!(control.consecutive_failures, 200);
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotwarden.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.append_decision(&test_decision("web", ActionType::Stay)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_decisions("web").unwrap().len(), 1);
        // Sequence continues after reopen.
        let seq = store.append_decision(&test_decision("web", ActionType::Stay)).unwrap();
        assert_eq!(seq, 2);
    }
}
