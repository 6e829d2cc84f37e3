//! Interruption probability estimate for rebalance recommendations.
//!
//! ```text
//! p = w_rate * pool_rate
//!   + w_age  * min(age_hours / age_saturation_hours, 1)
//!   + w_tod  * (1 inside the UTC peak window, peak_off_factor outside)
//! ```
//!
//! Clamped to 0..=1.

use spotwarden_core::HeuristicConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptionFactors {
    pub instance_age_secs: u64,
    /// Historical interruption frequency of the pool, 0..=1.
    pub pool_interruption_rate: f64,
    pub hour_utc: u8,
}

pub fn interruption_probability(config: &HeuristicConfig, factors: &InterruptionFactors) -> f64 {
    let age_hours = factors.instance_age_secs as f64 / 3600.0;
    let age = (age_hours / config.age_saturation_hours).min(1.0);
    let tod = if in_peak_window(config, factors.hour_utc) {
        1.0
    } else {
        config.peak_off_factor
    };
    let p = config.weight_pool_rate * factors.pool_interruption_rate.clamp(0.0, 1.0)
        + config.weight_age * age
        + config.weight_time_of_day * tod;
    p.clamp(0.0, 1.0)
}

/// UTC hour of a unix timestamp.
pub fn hour_of_day(ts: u64) -> u8 {
    ((ts % 86_400) / 3_600) as u8
}

fn in_peak_window(config: &HeuristicConfig, hour: u8) -> bool {
    let (start, end) = (config.peak_start_hour, config.peak_end_hour);
    if start <= end {
        hour >= start && hour < end
    } else {
        // Window wraps midnight.
        hour >= start || hour < end
    }
}
