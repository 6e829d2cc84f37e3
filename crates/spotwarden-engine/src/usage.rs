//! Stage 4: usage classification.

use spotwarden_core::{ComparisonOp, EngineConfig, ThresholdCheck, UsageClass, UsageSample};

/// Classify usage and record the four threshold comparisons.
///
/// Under-provisioning wins over over-provisioning; the two cannot both hold
/// with validated thresholds anyway.
pub fn classify_usage(config: &EngineConfig, usage: &UsageSample) -> (UsageClass, Vec<ThresholdCheck>) {
    let cpu_low = ThresholdCheck::evaluate(4, "usage", "cpu_p95", usage.cpu_p95, ComparisonOp::Lt, config.over_provisioned_cpu);
    let mem_low = ThresholdCheck::evaluate(4, "usage", "memory_p95", usage.memory_p95, ComparisonOp::Lt, config.over_provisioned_memory);
    let cpu_high = ThresholdCheck::evaluate(4, "usage", "cpu_p95", usage.cpu_p95, ComparisonOp::Gt, config.under_provisioned_cpu);
    let mem_high = ThresholdCheck::evaluate(4, "usage", "memory_p95", usage.memory_p95, ComparisonOp::Gt, config.under_provisioned_memory);

    let class = if cpu_high.passed || mem_high.passed {
        UsageClass::UnderProvisioned
    } else if cpu_low.passed && mem_low.passed {
        UsageClass::OverProvisioned
    } else {
        UsageClass::RightSized
    };
    (class, vec![cpu_low, mem_low, cpu_high, mem_high])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, mem: f64) -> UsageSample {
        UsageSample {
            cpu_p95: cpu,
            cpu_avg: cpu / 2.0,
            memory_p95: mem,
            memory_avg: mem / 2.0,
            network_p95: 10.0,
            window_secs: 3600,
        }
    }

    #[test]
    fn over_provisioned_needs_both_low() {
        let config = EngineConfig::default();
        assert_eq!(classify_usage(&config, &usage(20.0, 25.0)).0, UsageClass::OverProvisioned);
        assert_eq!(classify_usage(&config, &usage(20.0, 45.0)).0, UsageClass::RightSized);
    }

    #[test]
    fn under_provisioned_needs_either_high() {
        let config = EngineConfig::default();
        assert_eq!(classify_usage(&config, &usage(85.0, 30.0)).0, UsageClass::UnderProvisioned);
        assert_eq!(classify_usage(&config, &usage(10.0, 81.0)).0, UsageClass::UnderProvisioned);
    }

    #[test]
    fn thresholds_are_exact() {
        let config = EngineConfig::default();
        // Exactly at the boundary is not below/above it.
        assert_eq!(classify_usage(&config, &usage(30.0, 10.0)).0, UsageClass::RightSized);
        assert_eq!(classify_usage(&config, &usage(80.0, 80.0)).0, UsageClass::RightSized);
    }

    #[test]
    fn records_all_comparisons() {
        let (_, checks) = classify_usage(&EngineConfig::default(), &usage(50.0, 50.0));
        assert_eq!(checks.len(), 4);
        assert!(checks.iter().all(|c| c.stage == 4));
    }
}
