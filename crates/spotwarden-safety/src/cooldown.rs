//! Cooldown bookkeeping on a workload's control record.

use spotwarden_state::WorkloadControl;

/// Remaining cooldown end, if one is still active at `now`.
pub fn active_until(control: &WorkloadControl, now: u64) -> Option<u64> {
    control.cooldown_until.filter(|until| *until > now)
}

/// Extend the cooldown to `until`. An earlier value never shortens an
/// existing cooldown.
pub fn extend(control: &mut WorkloadControl, until: u64) {
    control.cooldown_until = Some(control.cooldown_until.map_or(until, |cur| cur.max(until)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_expires_at_boundary() {
        let mut control = WorkloadControl::new("web");
        assert_eq!(active_until(&control, 100), None);
        extend(&mut control, 200);
        assert_eq!(active_until(&control, 199), Some(200));
        assert_eq!(active_until(&control, 200), None);
    }

    #[test]
    fn extend_never_shortens() {
        let mut control = WorkloadControl::new("web");
        extend(&mut control, 500);
        extend(&mut control, 300);
        assert_eq!(control.cooldown_until, Some(500));
    }
}
