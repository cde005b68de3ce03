use backoff::ExponentialBackoff;
use std::time::Duration;

/// Restart policy applied by the device runner when a driver fails.
///
/// The first restart waits `restart_interval`; every subsequent failure
/// doubles the delay up to `max_backoff`. A run that lasted at least
/// `max_backoff` resets the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub restart_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_interval: Duration::from_millis(200),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Build an `ExponentialBackoff` from a restart policy.
///
/// Randomization is disabled so the k-th delay is exactly
/// `min(2^(k-1) * restart_interval, max_backoff)`. `current_interval` is
/// what `next_backoff` emits first, so it must start at the policy's
/// restart interval, not the crate default.
pub fn build_restart_backoff(policy: &RestartPolicy) -> ExponentialBackoff {
    let initial = policy.restart_interval.max(Duration::from_millis(1));
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: policy.max_backoff.max(policy.restart_interval),
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RestartPolicy {
            restart_interval: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
        };
        let mut bo = build_restart_backoff(&policy);

        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(bo.next_backoff().unwrap());
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );

        bo.reset();
        assert_eq!(bo.next_backoff().unwrap(), Duration::from_millis(200));
    }
}
