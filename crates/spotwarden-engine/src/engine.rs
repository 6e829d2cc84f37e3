//! Pipeline entry points.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use spotwarden_core::{
    ActionType, Decision, DecisionMetadata, EngineConfig, ForecastSource, Instance, PoolKey,
    PoolPrice, PoolView, PricingSnapshot, UsageSample, next_record_id,
};

use crate::catalog::{Catalog, discover_pools};
use crate::filters::{Trace, future_baseline_ok, improves_on, price_filter, usage_rule};
use crate::forecast::{Predictions, attach_forecast};
use crate::policy::{SelectionContext, SelectionRule, rank_candidates, select};
use crate::usage::classify_usage;

/// Frozen inputs for one decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionInput {
    pub instance: Instance,
    pub usage: UsageSample,
    pub pricing: PricingSnapshot,
    /// Evaluation time (unix seconds), used for staleness and cooldown.
    pub now: u64,
}

/// Pools that need a forecast this cycle: the current pool followed by the
/// stage 2 survivors. Empty when the current pool has no fresh price.
pub fn forecast_targets(config: &EngineConfig, input: &DecisionInput) -> Vec<PoolPrice> {
    let catalog = discover_pools(config, &input.instance, &input.pricing, input.now);
    let Some(current) = catalog.current else {
        return Vec::new();
    };
    let mut trace = Trace::default();
    let mut targets = price_filter(config, &current, &catalog.candidates, &mut trace);
    targets.insert(0, current);
    targets
}

/// Run the eight stages and produce exactly one decision.
pub fn decide(config: &EngineConfig, input: &DecisionInput, predictions: &Predictions) -> Decision {
    let instance = &input.instance;
    let mut trace = Trace::default();
    let mut metadata = DecisionMetadata {
        config: config.clone(),
        usage: Some(input.usage.clone()),
        effective_discount_margin: config.discount_margin,
        ..Default::default()
    };

    // Stage 1
    let catalog = discover_pools(config, instance, &input.pricing, input.now);
    for key in &catalog.stale {
        trace.reject(key, 1, "no recent price sample");
    }
    let Catalog {
        current: Some(current_price),
        candidates,
        ..
    } = &catalog
    else {
        let reason = format!("current pool {} has no recent price sample; staying", instance.pool_key());
        metadata.matched_rule = Some(SelectionRule::SafeDefault.name().to_string());
        return finish(config, input, metadata, trace, ActionType::Stay, None, None, reason);
    };

    // Stage 2
    let survivors = price_filter(config, current_price, candidates, &mut trace);

    // Stage 3
    let current = attach_forecast(current_price, predictions.get(&current_price.key));
    let views: Vec<PoolView> = survivors
        .iter()
        .map(|pool| attach_forecast(pool, predictions.get(&pool.key)))
        .collect();
    let degraded = current.forecast_source == ForecastSource::Fallback
        || views.iter().any(|v| v.forecast_source == ForecastSource::Fallback);
    let margin = if degraded {
        config.discount_margin * config.forecast_fallback_margin_factor
    } else {
        config.discount_margin
    };
    if degraded {
        debug!(workload = %instance.workload_id, margin, "forecast degraded, widening discount margin");
    }

    // Stage 4
    let (usage_class, usage_checks) = classify_usage(config, &input.usage);
    trace.checks.extend(usage_checks);

    // Stage 5
    let current_future_ok = future_baseline_ok(config, &current, margin, &mut trace);

    // Stages 6 and 7
    let mut qualified = Vec::new();
    for view in views {
        if let Some(reason) = usage_rule(config, usage_class, &current, &view, &mut trace) {
            trace.reject(&view.key, 6, reason);
            continue;
        }
        if !improves_on(config, &current, &view, &mut trace) {
            trace.reject(&view.key, 7, "future improvement below minimum");
            continue;
        }
        trace.accept(&view.key);
        qualified.push(view);
    }
    qualified.sort_by(rank_candidates);

    // Stage 8
    let fallback_target = fallback_target(config, &catalog, &current);
    let selection = select(&SelectionContext {
        config,
        usage_class,
        current: &current,
        current_future_ok,
        qualified: &qualified,
        fallback_target: &fallback_target,
    });

    metadata.usage_class = Some(usage_class);
    metadata.current_future_ok = Some(current_future_ok);
    metadata.forecast_degraded = degraded;
    metadata.effective_discount_margin = margin;
    metadata.matched_rule = Some(selection.rule.name().to_string());
    metadata.current_pool = Some(current);
    metadata.qualified = qualified;

    finish(
        config,
        input,
        metadata,
        trace,
        selection.action,
        selection.target_pool,
        selection.target_instance_type,
        selection.reason,
    )
}

/// On-demand placement for a fallback: the smallest strictly bigger type
/// in the current AZ when rightsizing up is allowed, else the current type.
fn fallback_target(config: &EngineConfig, catalog: &Catalog, current: &PoolView) -> PoolKey {
    if config.allow_rightsize_up {
        let bigger = catalog
            .candidates
            .iter()
            .filter(|p| p.key.az == current.key.az && p.shape.is_bigger_than(&current.shape))
            .min_by(|a, b| {
                a.shape
                    .vcpus
                    .cmp(&b.shape.vcpus)
                    .then(a.shape.memory_mib.cmp(&b.shape.memory_mib))
                    .then_with(|| a.key.cmp(&b.key))
            });
        if let Some(pool) = bigger {
            return pool.key.clone();
        }
    }
    current.key.clone()
}

#[allow(clippy::too_many_arguments)]
fn finish(
    config: &EngineConfig,
    input: &DecisionInput,
    mut metadata: DecisionMetadata,
    trace: Trace,
    action: ActionType,
    target_pool: Option<PoolKey>,
    target_instance_type: Option<String>,
    reason: String,
) -> Decision {
    metadata.checks = trace.checks;
    metadata.candidates = trace.candidates;

    let cooldown_until = action
        .is_transition()
        .then(|| input.now + config.cooldown().as_secs());

    info!(
        workload = %input.instance.workload_id,
        instance = %input.instance.id,
        action = %action,
        target = ?target_pool,
        rule = ?metadata.matched_rule,
        "decision computed"
    );

    Decision {
        id: next_record_id("dec"),
        workload_id: input.instance.workload_id.clone(),
        instance_id: input.instance.id.clone(),
        action,
        target_pool,
        target_instance_type,
        reason,
        cooldown_until,
        decided_at: input.now,
        dry_run: config.dry_run_mode,
        success: true,
        metadata,
    }
}
