//! Stage 1: pool discovery and deduplication.

use std::collections::BTreeMap;

use tracing::debug;

use spotwarden_core::{EngineConfig, Instance, PoolKey, PoolPrice, PricingSnapshot, instance_family};

/// Pools available to one instance after stage 1.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// The instance's own pool, if it has a recent price sample.
    pub current: Option<PoolPrice>,
    /// Every other fresh pool in the family, ordered by key.
    pub candidates: Vec<PoolPrice>,
    /// Pools dropped for lacking a recent price sample.
    pub stale: Vec<PoolKey>,
    /// Number of duplicate samples collapsed.
    pub duplicates: usize,
}

/// Collect the instance family's pools in its region, keep the latest
/// sample per pool identity, and drop pools whose latest sample is older
/// than `price_staleness_secs`.
pub fn discover_pools(
    config: &EngineConfig,
    instance: &Instance,
    pricing: &PricingSnapshot,
    now: u64,
) -> Catalog {
    let family = instance_family(&instance.instance_type);
    let mut latest: BTreeMap<PoolKey, PoolPrice> = BTreeMap::new();
    let mut duplicates = 0;

    for pool in pricing
        .pools
        .iter()
        .filter(|p| p.key.region == instance.region && p.key.family() == family)
    {
        match latest.get_mut(&pool.key) {
            Some(existing) => {
                duplicates += 1;
                if pool.observed_at > existing.observed_at {
                    *existing = pool.clone();
                }
            }
            None => {
                latest.insert(pool.key.clone(), pool.clone());
            }
        }
    }

    let mut catalog = Catalog {
        duplicates,
        ..Default::default()
    };
    let current_key = instance.pool_key();

    for (key, pool) in latest {
        if now.saturating_sub(pool.observed_at) > config.price_staleness_secs {
            catalog.stale.push(key);
            continue;
        }
        if key == current_key {
            catalog.current = Some(pool);
        } else {
            catalog.candidates.push(pool);
        }
    }

    debug!(
        instance = %instance.id,
        family,
        candidates = catalog.candidates.len(),
        stale = catalog.stale.len(),
        duplicates,
        current_priced = catalog.current.is_some(),
        "pool discovery complete"
    );
    catalog
}
