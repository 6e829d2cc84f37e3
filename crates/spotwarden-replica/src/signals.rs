//! Typed interruption signals and their sources.
//!
//! How signals are obtained (metadata endpoint polling, event bus) is an
//! adapter concern; the core only consumes [`SignalSource`].

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use spotwarden_core::{InstanceId, SignalKind, WorkloadId};

/// Horizon assumed for a rebalance recommendation.
pub const REBALANCE_HORIZON_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionSignal {
    pub workload_id: WorkloadId,
    pub instance_id: InstanceId,
    pub kind: SignalKind,
    pub detected_at: u64,
    /// When the provider will reclaim the instance.
    pub deadline: u64,
}

impl InterruptionSignal {
    pub fn rebalance(workload_id: &str, instance_id: &str, detected_at: u64) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            instance_id: instance_id.to_string(),
            kind: SignalKind::RebalanceRecommendation,
            detected_at,
            deadline: detected_at + REBALANCE_HORIZON_SECS,
        }
    }

    pub fn termination_notice(workload_id: &str, instance_id: &str, detected_at: u64, deadline: u64) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            instance_id: instance_id.to_string(),
            kind: SignalKind::TerminationNotice,
            detected_at,
            deadline,
        }
    }
}

pub type SignalFuture<'a> = Pin<Box<dyn Future<Output = Option<InterruptionSignal>> + Send + 'a>>;

/// Stream of interruption signals. `None` means the source is exhausted.
pub trait SignalSource: Send {
    fn next_signal(&mut self) -> SignalFuture<'_>;
}

/// Signal source fed through an mpsc channel.
pub struct ChannelSignalSource {
    rx: mpsc::Receiver<InterruptionSignal>,
}

impl ChannelSignalSource {
    pub fn new(rx: mpsc::Receiver<InterruptionSignal>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<InterruptionSignal>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

impl SignalSource for ChannelSignalSource {
    fn next_signal(&mut self) -> SignalFuture<'_> {
        Box::pin(self.rx.recv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_delivers_in_order() {
        let (tx, mut source) = ChannelSignalSource::channel(4);
        tx.send(InterruptionSignal::rebalance("web", "i-1", 100)).await.unwrap();
        tx.send(InterruptionSignal::termination_notice("web", "i-1", 200, 320))
            .await
            .unwrap();
        drop(tx);

        let first = source.next_signal().await.unwrap();
        assert_eq!(first.kind, SignalKind::RebalanceRecommendation);
        assert_eq!(first.deadline, 100 + REBALANCE_HORIZON_SECS);
        let second = source.next_signal().await.unwrap();
        assert_eq!(second.kind, SignalKind::TerminationNotice);
        assert_eq!(second.deadline, 320);
        assert!(source.next_signal().await.is_none());
    }
}
