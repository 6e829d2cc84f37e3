//! The `Executor` seam over cloud provider calls.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spotwarden_core::{
    InstanceId, InstanceRole, InstanceStatus, Lifecycle, PoolKey, PricingSnapshot, UsageSample,
    WorkloadId,
};

use crate::error::ProviderResult;

/// Boxed future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// What the provider reports about a running instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDescription {
    pub id: InstanceId,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub lifecycle: Lifecycle,
    pub status: InstanceStatus,
    pub launched_at: u64,
}

/// Parameters for launching an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchSpec {
    pub workload_id: WorkloadId,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub lifecycle: Lifecycle,
    /// Role the instance is launched for; used for tagging.
    pub role: InstanceRole,
}

impl LaunchSpec {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.region, &self.az, &self.instance_type)
    }
}

/// Wraps the cloud provider. Only these calls may block or take
/// non-trivial time inside a cycle.
pub trait Executor: Send + Sync {
    fn get_instance_state<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, InstanceDescription>;

    fn get_usage_metrics<'a>(
        &'a self,
        id: &'a str,
        window: Duration,
    ) -> ProviderFuture<'a, UsageSample>;

    /// Prices for the family of `instance_type` in `region`. When `pools`
    /// is non-empty, those pools are included even outside the family.
    fn get_pricing_snapshot<'a>(
        &'a self,
        instance_type: &'a str,
        region: &'a str,
        pools: &'a [PoolKey],
    ) -> ProviderFuture<'a, PricingSnapshot>;

    fn launch_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceId>;

    /// Returns whether the provider accepted the termination.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, bool>;

    /// Returns `false` if `state` was not reached within `timeout`.
    fn wait_for_instance_state<'a>(
        &'a self,
        id: &'a str,
        state: InstanceStatus,
        timeout: Duration,
    ) -> ProviderFuture<'a, bool>;
}
