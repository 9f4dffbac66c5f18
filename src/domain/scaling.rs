use tokio::time::Instant;

use super::entity::QueueDepth;
use super::policy::ScalingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub direction: Direction,
    pub previous: usize,
    pub desired: usize,
}

/// Owned by the autoscaler. Nothing else writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolState {
    pub desired_concurrency: usize,
    pub last_scale_out_at: Option<Instant>,
    pub last_scale_in_at: Option<Instant>,
}

impl WorkerPoolState {
    pub fn new(initial: usize) -> Self {
        Self {
            desired_concurrency: initial,
            last_scale_out_at: None,
            last_scale_in_at: None,
        }
    }

    fn cooled_down(last: Option<Instant>, cooldown: std::time::Duration, now: Instant) -> bool {
        match last {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        }
    }

    /// Target tracking: size capacity so the signal would sit at the target.
    /// Returns the decision taken, or `None` if capacity stays put (signal
    /// inside the dead band, already at a bound, or the direction's cooldown
    /// has not elapsed).
    pub fn decide(&mut self, policy: &ScalingPolicy, signal: f64, now: Instant) -> Option<Decision> {
        if !signal.is_finite() {
            return None;
        }
        let signal = signal.max(0.0);
        let current = self.desired_concurrency;
        let target = policy.target_utilization;

        let proposed = if signal > target || signal < target * (1.0 - policy.scale_in_margin) {
            let raw = (current.max(1) as f64 * signal / target).ceil();
            if raw >= policy.max_capacity as f64 {
                policy.max_capacity
            } else {
                raw as usize
            }
        } else {
            current
        };

        let desired = proposed.clamp(policy.min_capacity, policy.max_capacity);
        if desired == current {
            return None;
        }

        let direction = if desired > current {
            Direction::Out
        } else {
            Direction::In
        };

        match direction {
            Direction::Out => {
                if !Self::cooled_down(self.last_scale_out_at, policy.scale_out_cooldown, now) {
                    return None;
                }
                self.last_scale_out_at = Some(now);
            }
            Direction::In => {
                if !Self::cooled_down(self.last_scale_in_at, policy.scale_in_cooldown, now) {
                    return None;
                }
                self.last_scale_in_at = Some(now);
            }
        }

        self.desired_concurrency = desired;

        Some(Decision {
            direction,
            previous: current,
            desired,
        })
    }
}

/// Where the autoscaler reads its load signal from.
#[async_trait::async_trait]
pub trait SignalSource: Send + Sync + 'static {
    async fn observe(&self) -> anyhow::Result<f64>;
}

/// What the autoscaler resizes. Implementations must not block on in-flight
/// work when shrinking.
#[async_trait::async_trait]
pub trait CapacityKnob: Send + Sync + 'static {
    async fn current(&self) -> usize;
    async fn set_desired(&self, desired: usize) -> anyhow::Result<()>;
}

pub fn utilization(busy: usize, allocated: usize) -> f64 {
    if allocated == 0 {
        return if busy > 0 { 1.0 } else { 0.0 };
    }
    busy as f64 / allocated as f64
}

/// Queue depth normalized by what the current capacity is sized to absorb,
/// so 1.0 means "exactly at the per-worker backlog target".
pub fn backlog(depth: QueueDepth, capacity: usize, target_per_worker: f64) -> f64 {
    let total = depth.total() as f64;
    if capacity == 0 {
        return if total > 0.0 { 1.0 } else { 0.0 };
    }
    total / (capacity as f64 * target_per_worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min_capacity: 1,
            max_capacity: 20,
            target_utilization: 0.75,
            scale_in_margin: 0.1,
            scale_out_cooldown: Duration::from_secs(30),
            scale_in_cooldown: Duration::from_secs(120),
            ..ScalingPolicy::default()
        }
    }

    #[test]
    fn scales_out_above_target() {
        let now = Instant::now();
        let mut state = WorkerPoolState::new(4);

        let decision = state.decide(&policy(), 1.0, now).unwrap();
        assert_eq!(decision.direction, Direction::Out);
        assert_eq!(decision.previous, 4);
        // ceil(4 * 1.0 / 0.75) = 6
        assert_eq!(decision.desired, 6);
        assert_eq!(state.last_scale_out_at, Some(now));
    }

    #[test]
    fn holds_inside_dead_band() {
        let now = Instant::now();
        let mut state = WorkerPoolState::new(4);

        assert_eq!(state.decide(&policy(), 0.75, now), None);
        assert_eq!(state.decide(&policy(), 0.70, now), None);
        assert_eq!(state.desired_concurrency, 4);
    }

    #[test]
    fn scales_in_when_comfortably_below() {
        let now = Instant::now();
        let mut state = WorkerPoolState::new(8);

        let decision = state.decide(&policy(), 0.3, now).unwrap();
        assert_eq!(decision.direction, Direction::In);
        // ceil(8 * 0.3 / 0.75) = 4
        assert_eq!(decision.desired, 4);
    }

    #[test]
    fn scale_out_respects_cooldown() {
        let start = Instant::now();
        let mut state = WorkerPoolState::new(2);

        assert!(state.decide(&policy(), 1.0, start).is_some());
        assert!(state
            .decide(&policy(), 1.0, start + Duration::from_secs(10))
            .is_none());
        assert!(state
            .decide(&policy(), 1.0, start + Duration::from_secs(30))
            .is_some());
    }

    #[test]
    fn scale_in_cooldown_is_independent_of_scale_out() {
        let start = Instant::now();
        let mut state = WorkerPoolState::new(10);

        assert!(state.decide(&policy(), 0.1, start).is_some());
        let after_in = state.desired_concurrency;

        // A burst right after a scale-in is still absorbed.
        let out = state
            .decide(&policy(), 1.0, start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(out.direction, Direction::Out);
        assert!(out.desired > after_in);

        // But another scale-in waits out the long cooldown.
        assert!(state
            .decide(&policy(), 0.0, start + Duration::from_secs(60))
            .is_none());
        assert!(state
            .decide(&policy(), 0.0, start + Duration::from_secs(121))
            .is_some());
    }

    #[test]
    fn clamps_to_bounds() {
        let now = Instant::now();
        let mut state = WorkerPoolState::new(18);
        let decision = state.decide(&policy(), 50.0, now).unwrap();
        assert_eq!(decision.desired, 20);

        let mut state = WorkerPoolState::new(3);
        let decision = state.decide(&policy(), 0.0, now).unwrap();
        assert_eq!(decision.desired, 1);
    }

    #[test]
    fn ignores_nan_signal() {
        let mut state = WorkerPoolState::new(3);
        assert_eq!(state.decide(&policy(), f64::NAN, Instant::now()), None);
    }

    #[test]
    fn grows_from_zero_capacity() {
        let mut p = policy();
        p.min_capacity = 0;
        let mut state = WorkerPoolState::new(0);
        let decision = state.decide(&p, 1.0, Instant::now()).unwrap();
        assert_eq!(decision.desired, 2);
    }

    #[test]
    fn signals() {
        assert_eq!(utilization(3, 4), 0.75);
        assert_eq!(utilization(0, 0), 0.0);
        let depth = QueueDepth {
            visible: 15,
            in_flight: 5,
        };
        assert_eq!(backlog(depth, 2, 10.0), 1.0);
        assert_eq!(backlog(depth, 0, 10.0), 1.0);
        assert_eq!(backlog(QueueDepth::default(), 0, 10.0), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any signal sequence, desired concurrency stays within
        /// bounds and same-direction decisions respect their cooldowns.
        #[test]
        fn bounds_and_cooldowns_hold(
            initial in 0usize..40,
            min in 0usize..5,
            span in 1usize..30,
            steps in prop::collection::vec((0.0f64..3.0, 0u64..90), 1..60),
        ) {
            let mut p = policy();
            p.min_capacity = min;
            p.max_capacity = min + span;

            let mut state = WorkerPoolState::new(initial.clamp(p.min_capacity, p.max_capacity));
            let mut now = Instant::now();
            let mut last_out: Option<Instant> = None;
            let mut last_in: Option<Instant> = None;

            for (signal, advance) in steps {
                now += Duration::from_secs(advance);
                if let Some(decision) = state.decide(&p, signal, now) {
                    match decision.direction {
                        Direction::Out => {
                            if let Some(prev) = last_out {
                                prop_assert!(now - prev >= p.scale_out_cooldown);
                            }
                            last_out = Some(now);
                        }
                        Direction::In => {
                            if let Some(prev) = last_in {
                                prop_assert!(now - prev >= p.scale_in_cooldown);
                            }
                            last_in = Some(now);
                        }
                    }
                }
                prop_assert!(state.desired_concurrency >= p.min_capacity);
                prop_assert!(state.desired_concurrency <= p.max_capacity);
            }
        }
    }
}
