//! Stage 8: action selection.
//!
//! Selection is an ordered list of guard/action rules evaluated in
//! sequence; the first rule whose guard holds produces the action. The
//! order lives in [`SELECTION_ORDER`] and nowhere else.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use spotwarden_core::{ActionType, EngineConfig, PoolKey, PoolView, UsageClass};

/// Inputs the selection rules look at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub config: &'a EngineConfig,
    pub usage_class: UsageClass,
    pub current: &'a PoolView,
    pub current_future_ok: bool,
    /// Candidates that survived stages 6 and 7, best first.
    pub qualified: &'a [PoolView],
    /// On-demand placement to use when falling back.
    pub fallback_target: &'a PoolKey,
}

/// Outcome of the first matching rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub rule: SelectionRule,
    pub action: ActionType,
    pub target_pool: Option<PoolKey>,
    pub target_instance_type: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    /// Current pool is fine for the next hour and the workload is not starved.
    StayOnHealthyPool,
    /// Move to the best qualified spot pool.
    SwitchToBestCandidate,
    /// Under-provisioned with nowhere to go on spot.
    FallbackOnDemand,
    /// Nothing else matched.
    SafeDefault,
}

pub const SELECTION_ORDER: [SelectionRule; 4] = [
    SelectionRule::StayOnHealthyPool,
    SelectionRule::SwitchToBestCandidate,
    SelectionRule::FallbackOnDemand,
    SelectionRule::SafeDefault,
];

impl SelectionRule {
    pub fn name(self) -> &'static str {
        match self {
            Self::StayOnHealthyPool => "stay_on_healthy_pool",
            Self::SwitchToBestCandidate => "switch_to_best_candidate",
            Self::FallbackOnDemand => "fallback_on_demand",
            Self::SafeDefault => "safe_default",
        }
    }

    /// Evaluate this rule's guard; `Some` when it matches.
    pub fn evaluate(self, ctx: &SelectionContext<'_>) -> Option<Selection> {
        match self {
            Self::StayOnHealthyPool => {
                if !ctx.current_future_ok || ctx.usage_class == UsageClass::UnderProvisioned {
                    return None;
                }
                Some(self.stay(
                    ctx,
                    format!(
                        "current pool {} stays within baseline for the next hour \
                         (predicted discount {:.3}, volatility {:.4}); usage {}",
                        ctx.current.key,
                        ctx.current.predicted_discount,
                        ctx.current.predicted_volatility,
                        ctx.usage_class
                    ),
                ))
            }
            Self::SwitchToBestCandidate => {
                let best = ctx.qualified.first()?;
                Some(Selection {
                    rule: self,
                    action: ActionType::SwitchToSpot,
                    target_pool: Some(best.key.clone()),
                    target_instance_type: Some(best.key.instance_type.clone()),
                    reason: format!(
                        "switching to {}: predicted discount {:.3} vs {:.3}, volatility {:.4} vs {:.4}; usage {}",
                        best.key,
                        best.predicted_discount,
                        ctx.current.predicted_discount,
                        best.predicted_volatility,
                        ctx.current.predicted_volatility,
                        ctx.usage_class
                    ),
                })
            }
            Self::FallbackOnDemand => {
                if ctx.usage_class != UsageClass::UnderProvisioned || !ctx.config.fallback_to_ondemand_enabled {
                    return None;
                }
                Some(Selection {
                    rule: self,
                    action: ActionType::FallbackOndemand,
                    target_pool: Some(ctx.fallback_target.clone()),
                    target_instance_type: Some(ctx.fallback_target.instance_type.clone()),
                    reason: format!(
                        "under-provisioned with no bigger stable spot pool; falling back to on-demand {}",
                        ctx.fallback_target.instance_type
                    ),
                })
            }
            Self::SafeDefault => Some(self.stay(
                ctx,
                format!(
                    "no qualifying action; staying on {} (future ok: {}, usage {})",
                    ctx.current.key, ctx.current_future_ok, ctx.usage_class
                ),
            )),
        }
    }

    fn stay(self, ctx: &SelectionContext<'_>, reason: String) -> Selection {
        Selection {
            rule: self,
            action: ActionType::Stay,
            target_pool: Some(ctx.current.key.clone()),
            target_instance_type: Some(ctx.current.key.instance_type.clone()),
            reason,
        }
    }
}

/// Run the rules in order and return the first match.
pub fn select(ctx: &SelectionContext<'_>) -> Selection {
    for rule in SELECTION_ORDER {
        if let Some(selection) = rule.evaluate(ctx) {
            return selection;
        }
    }
    // SafeDefault always matches; kept total for the type checker.
    SelectionRule::SafeDefault.stay(ctx, format!("staying on {}", ctx.current.key))
}

/// Candidate ranking: lowest predicted volatility, then highest predicted
/// discount, then pool key.
pub fn rank_candidates(a: &PoolView, b: &PoolView) -> Ordering {
    a.predicted_volatility
        .total_cmp(&b.predicted_volatility)
        .then_with(|| b.predicted_discount.total_cmp(&a.predicted_discount))
        .then_with(|| a.key.cmp(&b.key))
}
