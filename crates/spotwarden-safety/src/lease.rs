//! Single-writer leases per workload.
//!
//! A lease is held for the duration of one decision cycle or one signal
//! handler. Dropping the [`Lease`] releases it. Holders are expected to
//! race their provider calls against [`Lease::cancelled`] and stop at the
//! next safe point when a termination notice preempts them. A holder that
//! does not let go within the preemptor's grace period loses the slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use spotwarden_core::WorkloadId;

/// What the lease holder is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    DecisionCycle,
    Rebalance,
    Failover,
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DecisionCycle => "decision-cycle",
            Self::Rebalance => "rebalance",
            Self::Failover => "failover",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("workload {workload_id} is busy with {holder}")]
pub struct LeaseBusy {
    pub workload_id: WorkloadId,
    pub holder: LeaseKind,
}

struct Slot {
    generation: u64,
    kind: LeaseKind,
    cancel_tx: watch::Sender<bool>,
    /// Dropped with the slot; waiters see the channel close.
    released_tx: watch::Sender<()>,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    slots: HashMap<WorkloadId, Slot>,
}

/// Lease registry shared by everything that mutates a workload.
#[derive(Clone, Default)]
pub struct LeaseTable {
    inner: Arc<Mutex<Inner>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    /// Take the lease if nobody holds it.
    pub fn try_acquire(&self, workload_id: &str, kind: LeaseKind) -> Result<Lease, LeaseBusy> {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get(workload_id) {
            return Err(LeaseBusy {
                workload_id: workload_id.to_string(),
                holder: slot.kind,
            });
        }
        Ok(self.insert(&mut inner, workload_id, kind))
    }

    /// Take the lease, cancelling any current holder and waiting up to
    /// `grace` for it to let go. Past that the slot is taken over; the old
    /// holder stays cancelled and its drop releases nothing.
    pub async fn preempt(&self, workload_id: &str, kind: LeaseKind, grace: Duration) -> Lease {
        let limit = tokio::time::Instant::now() + grace;
        loop {
            let mut released = {
                let mut inner = self.lock();
                match inner.slots.get(workload_id) {
                    None => return self.insert(&mut inner, workload_id, kind),
                    Some(slot) => {
                        if !*slot.cancel_tx.borrow() {
                            info!(
                                workload = %workload_id,
                                holder = %slot.kind,
                                preempted_by = %kind,
                                "preempting lease holder"
                            );
                        }
                        slot.cancel_tx.send_replace(true);
                        slot.released_tx.subscribe()
                    }
                }
            };
            // Resolves with an error once the holder's slot is dropped.
            let waited = tokio::time::timeout_at(limit, async {
                while released.changed().await.is_ok() {}
            })
            .await;
            if waited.is_err() {
                let mut inner = self.lock();
                if let Some(slot) = inner.slots.get(workload_id) {
                    warn!(
                        workload = %workload_id,
                        holder = %slot.kind,
                        preempted_by = %kind,
                        ?grace,
                        "lease holder did not yield, taking over"
                    );
                }
                return self.insert(&mut inner, workload_id, kind);
            }
        }
    }

    /// Kind of the current holder, if any.
    pub fn holder(&self, workload_id: &str) -> Option<LeaseKind> {
        self.lock().slots.get(workload_id).map(|s| s.kind)
    }

    fn insert(&self, inner: &mut Inner, workload_id: &str, kind: LeaseKind) -> Lease {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (released_tx, _) = watch::channel(());
        inner.slots.insert(
            workload_id.to_string(),
            Slot {
                generation,
                kind,
                cancel_tx,
                released_tx,
            },
        );
        debug!(workload = %workload_id, kind = %kind, generation, "lease acquired");
        Lease {
            table: Arc::clone(&self.inner),
            workload_id: workload_id.to_string(),
            kind,
            generation,
            cancel_rx,
        }
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive right to mutate one workload. Released on drop.
pub struct Lease {
    table: Arc<Mutex<Inner>>,
    workload_id: WorkloadId,
    kind: LeaseKind,
    generation: u64,
    cancel_rx: watch::Receiver<bool>,
}

impl Lease {
    pub fn workload_id(&self) -> &str {
        &self.workload_id
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    /// True once a preempting holder asked this one to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when the lease is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // An error means the slot is gone, which only happens on drop.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("workload_id", &self.workload_id)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut inner = lock_inner(&self.table);
        let ours = inner
            .slots
            .get(&self.workload_id)
            .is_some_and(|slot| slot.generation == self.generation);
        if ours {
            inner.slots.remove(&self.workload_id);
            debug!(workload = %self.workload_id, kind = %self.kind, "lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(2);

    #[test]
    fn second_acquire_is_rejected() {
        let table = LeaseTable::new();
        let lease = table.try_acquire("web", LeaseKind::DecisionCycle).unwrap();
        let err = table.try_acquire("web", LeaseKind::Rebalance).unwrap_err();
        assert_eq!(err.holder, LeaseKind::DecisionCycle);
        // Different workloads are independent.
        assert!(table.try_acquire("api", LeaseKind::DecisionCycle).is_ok());
        drop(lease);
        assert!(table.try_acquire("web", LeaseKind::Rebalance).is_ok());
    }

    #[tokio::test]
    async fn preempt_on_free_workload_is_immediate() {
        let table = LeaseTable::new();
        let lease = table.preempt("web", LeaseKind::Failover, GRACE).await;
        assert_eq!(lease.kind(), LeaseKind::Failover);
        assert_eq!(table.holder("web"), Some(LeaseKind::Failover));
    }

    #[tokio::test]
    async fn preempt_cancels_holder_and_waits_for_release() {
        let table = LeaseTable::new();
        let lease = table.try_acquire("web", LeaseKind::Rebalance).unwrap();

        let holder = tokio::spawn(async move {
            lease.cancelled().await;
            assert!(lease.is_cancelled());
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(lease);
        });

        let preempting = tokio::time::timeout(
            Duration::from_secs(2),
            table.preempt("web", LeaseKind::Failover, GRACE),
        )
        .await
        .expect("preempt completes once the holder lets go");
        assert_eq!(preempting.kind(), LeaseKind::Failover);
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn holder_that_never_yields_is_taken_over_after_grace() {
        let table = LeaseTable::new();
        let stubborn = table.try_acquire("web", LeaseKind::DecisionCycle).unwrap();

        let started = std::time::Instant::now();
        let failover = table
            .preempt("web", LeaseKind::Failover, Duration::from_millis(50))
            .await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(stubborn.is_cancelled());
        assert_eq!(table.holder("web"), Some(LeaseKind::Failover));

        // The displaced holder's drop leaves the new lease in place.
        drop(stubborn);
        assert_eq!(table.holder("web"), Some(LeaseKind::Failover));
        drop(failover);
        assert_eq!(table.holder("web"), None);
    }

    #[tokio::test]
    async fn stale_lease_drop_does_not_release_new_holder() {
        let table = LeaseTable::new();
        let first = table.try_acquire("web", LeaseKind::DecisionCycle).unwrap();
        drop(first);
        let second = table.try_acquire("web", LeaseKind::DecisionCycle).unwrap();
        assert_eq!(table.holder("web"), Some(LeaseKind::DecisionCycle));
        drop(second);
        assert_eq!(table.holder("web"), None);
    }
}
