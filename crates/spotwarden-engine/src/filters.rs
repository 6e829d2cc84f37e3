//! Filter stages 2, 5, 6 and 7.
//!
//! Each filter records its comparisons into a [`Trace`] and returns whether
//! the subject passed. Rejections are recorded per pool with the stage
//! number and a human-readable reason.

use spotwarden_core::{
    CandidateOutcome, ComparisonOp, EngineConfig, PoolKey, PoolPrice, PoolView, ThresholdCheck,
    UsageClass,
};

/// Comparisons and per-pool outcomes accumulated across the pipeline.
#[derive(Debug, Default)]
pub struct Trace {
    pub checks: Vec<ThresholdCheck>,
    pub candidates: Vec<CandidateOutcome>,
}

impl Trace {
    fn check(
        &mut self,
        stage: u8,
        subject: &PoolKey,
        metric: &str,
        value: f64,
        op: ComparisonOp,
        threshold: f64,
    ) -> bool {
        let check = ThresholdCheck::evaluate(stage, subject.to_string(), metric, value, op, threshold);
        let passed = check.passed;
        self.checks.push(check);
        passed
    }

    pub fn reject(&mut self, pool: &PoolKey, stage: u8, reason: impl Into<String>) {
        self.candidates.push(CandidateOutcome {
            pool: pool.clone(),
            rejected_at: Some(stage),
            reason: Some(reason.into()),
        });
    }

    pub fn accept(&mut self, pool: &PoolKey) {
        self.candidates.push(CandidateOutcome {
            pool: pool.clone(),
            rejected_at: None,
            reason: None,
        });
    }
}

/// Stage 2: keep pools priced within tolerance of the current pool and
/// discounted at least `baseline_discount - 2 * discount_margin`.
pub fn price_filter(
    config: &EngineConfig,
    current: &PoolPrice,
    pools: &[PoolPrice],
    trace: &mut Trace,
) -> Vec<PoolPrice> {
    let max_price = current.spot_price * config.current_price_tolerance;
    let min_discount = config.baseline_discount - 2.0 * config.discount_margin;

    let mut survivors = Vec::new();
    for pool in pools {
        let price_ok = trace.check(2, &pool.key, "spot_price", pool.spot_price, ComparisonOp::Le, max_price);
        let discount_ok = trace.check(2, &pool.key, "discount", pool.discount(), ComparisonOp::Ge, min_discount);
        match (price_ok, discount_ok) {
            (true, true) => survivors.push(pool.clone()),
            (false, _) => trace.reject(
                &pool.key,
                2,
                format!("spot price {:.4} above {:.4}", pool.spot_price, max_price),
            ),
            (true, false) => trace.reject(
                &pool.key,
                2,
                format!("discount {:.3} below {:.3}", pool.discount(), min_discount),
            ),
        }
    }
    survivors
}

/// Stage 5: is the current pool expected to stay within baseline for the
/// next hour?
pub fn future_baseline_ok(config: &EngineConfig, current: &PoolView, margin: f64, trace: &mut Trace) -> bool {
    let discount_ok = trace.check(
        5,
        &current.key,
        "predicted_discount",
        current.predicted_discount,
        ComparisonOp::Ge,
        config.baseline_discount - margin,
    );
    let volatility_ok = trace.check(
        5,
        &current.key,
        "predicted_volatility",
        current.predicted_volatility,
        ComparisonOp::Le,
        config.baseline_volatility * config.volatility_factor_max,
    );
    discount_ok && volatility_ok
}

/// Stage 6: shape and price constraints for the usage class. Returns the
/// rejection reason, if any.
pub fn usage_rule(
    config: &EngineConfig,
    class: UsageClass,
    current: &PoolView,
    candidate: &PoolView,
    trace: &mut Trace,
) -> Option<String> {
    match class {
        UsageClass::OverProvisioned if config.allow_rightsize_down => {
            if !candidate.shape.is_smaller_than(&current.shape) {
                if candidate.shape.is_bigger_than(&current.shape) && candidate.current_price < current.current_price {
                    return Some("bigger-but-cheaper pool not allowed for an over-provisioned workload".to_string());
                }
                return Some("shape is not strictly smaller".to_string());
            }
            let cheaper = trace.check(
                6,
                &candidate.key,
                "spot_price",
                candidate.current_price,
                ComparisonOp::Lt,
                current.current_price,
            );
            let stabler = trace.check(
                6,
                &candidate.key,
                "predicted_volatility",
                candidate.predicted_volatility,
                ComparisonOp::Lt,
                current.predicted_volatility,
            );
            match (cheaper, stabler) {
                (true, true) => None,
                (false, _) => Some("smaller pool is not cheaper".to_string()),
                (true, false) => Some("smaller pool is not more stable".to_string()),
            }
        }
        UsageClass::UnderProvisioned => {
            if !config.allow_rightsize_up {
                return Some("rightsizing up is disabled".to_string());
            }
            if !candidate.shape.is_bigger_than(&current.shape) {
                return Some("shape is not strictly bigger".to_string());
            }
            let affordable = trace.check(
                6,
                &candidate.key,
                "spot_price",
                candidate.current_price,
                ComparisonOp::Le,
                current.current_price,
            );
            let stable = trace.check(
                6,
                &candidate.key,
                "predicted_volatility",
                candidate.predicted_volatility,
                ComparisonOp::Le,
                config.baseline_volatility * config.volatility_factor_max,
            );
            match (affordable, stable) {
                (true, true) => None,
                (false, _) => Some("bigger pool costs more than the current pool".to_string()),
                (true, false) => Some("bigger pool is not stable".to_string()),
            }
        }
        // Over-provisioned with downsizing disabled is handled as right-sized.
        UsageClass::OverProvisioned | UsageClass::RightSized => {
            let same_type = candidate.key.instance_type == current.key.instance_type;
            if same_type || candidate.shape.is_similar_to(&current.shape, config.similar_shape_tolerance) {
                None
            } else {
                Some("shape differs from the current pool".to_string())
            }
        }
    }
}

/// Stage 7: the candidate must beat the current pool on predicted discount
/// and predicted risk at the same time.
pub fn improves_on(config: &EngineConfig, current: &PoolView, candidate: &PoolView, trace: &mut Trace) -> bool {
    let gain_ok = trace.check(
        7,
        &candidate.key,
        "discount_gain",
        candidate.predicted_discount - current.predicted_discount,
        ComparisonOp::Ge,
        config.min_future_discount_gain,
    );
    let risk_ok = trace.check(
        7,
        &candidate.key,
        "risk_improvement",
        current.predicted_risk() - candidate.predicted_risk(),
        ComparisonOp::Ge,
        config.min_future_risk_improvement,
    );
    gain_ok && risk_ok
}
