//! Adaptive polling interval
//!
//! Activity shrinks the interval toward the configured minimum; a run of empty
//! polls grows it toward the maximum. A job starts at the base interval;
//! binding a channel that asks for a faster interval pulls it down immediately.

use std::time::Duration;

use tablewatch_common::config::PollingConfig;

/// Bounds and factors of the adaptive schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalPolicy {
    pub min_ms: u64,
    pub base_ms: u64,
    pub max_ms: u64,
    pub shrink_factor: f64,
    pub growth_factor: f64,
    pub empty_poll_threshold: u32,
}

impl IntervalPolicy {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            min_ms: config.min_interval_ms,
            base_ms: config.base_interval_ms,
            max_ms: config.max_interval_ms,
            shrink_factor: config.shrink_factor,
            growth_factor: config.growth_factor,
            empty_poll_threshold: config.empty_poll_threshold.max(1),
        }
    }

    pub fn clamp(&self, interval_ms: u64) -> u64 {
        interval_ms.clamp(self.min_ms, self.max_ms)
    }
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

/// Poll outcome fed back into the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The poll found changes
    Activity,
    /// The poll found nothing
    Empty,
    /// The poll failed; the schedule is left alone
    Failed,
}

/// Current interval of one job
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    policy: IntervalPolicy,
    current_ms: u64,
    empty_polls: u32,
    active_polls: u32,
}

impl AdaptiveInterval {
    /// Start at the base interval, clamped to bounds
    pub fn new(policy: IntervalPolicy) -> Self {
        Self {
            policy,
            current_ms: policy.clamp(policy.base_ms),
            empty_polls: 0,
            active_polls: 0,
        }
    }

    pub fn policy(&self) -> &IntervalPolicy {
        &self.policy
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }

    pub fn active_polls(&self) -> u32 {
        self.active_polls
    }

    /// Apply one poll outcome; returns the new interval
    pub fn record(&mut self, outcome: PollOutcome) -> u64 {
        match outcome {
            PollOutcome::Activity => {
                self.empty_polls = 0;
                self.active_polls = self.active_polls.saturating_add(1);
                let shrunk = scale(self.current_ms, self.policy.shrink_factor);
                self.current_ms = self.policy.clamp(shrunk);
            }
            PollOutcome::Empty => {
                self.active_polls = 0;
                self.empty_polls = self.empty_polls.saturating_add(1);
                if self.empty_polls >= self.policy.empty_poll_threshold {
                    let grown = scale(self.current_ms, self.policy.growth_factor);
                    self.current_ms = self.policy.clamp(grown);
                }
            }
            PollOutcome::Failed => {}
        }
        self.current_ms
    }

    /// A trigger event counts as activity for the empty streak only
    pub fn note_trigger(&mut self) {
        self.empty_polls = 0;
    }

    /// Apply the preferences of the channels bound to the job.
    ///
    /// `requested` holds each channel's preference, 0 meaning none. The
    /// interval drops to the fastest preference when that is faster; a
    /// channel leaving never slows the job down by itself.
    pub fn rebind(&mut self, requested: impl IntoIterator<Item = u64>) -> u64 {
        if let Some(fastest) = requested.into_iter().filter(|ms| *ms > 0).min() {
            self.current_ms = self.policy.clamp(fastest.min(self.current_ms));
        }
        self.current_ms
    }
}

fn scale(value_ms: u64, factor: f64) -> u64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = (value_ms as f64 * factor).round().max(0.0) as u64;
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_activity_converges_to_minimum() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        assert_eq!(interval.current_ms(), 30_000);
        assert_eq!(interval.record(PollOutcome::Activity), 15_000);
        assert_eq!(interval.record(PollOutcome::Activity), 7_500);
        assert_eq!(interval.record(PollOutcome::Activity), 5_000);
        assert_eq!(interval.record(PollOutcome::Activity), 5_000);
    }

    #[test]
    fn test_empty_polls_grow_after_threshold() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        assert_eq!(interval.record(PollOutcome::Empty), 30_000);
        assert_eq!(interval.record(PollOutcome::Empty), 30_000);
        assert_eq!(interval.record(PollOutcome::Empty), 45_000);
        assert_eq!(interval.record(PollOutcome::Empty), 67_500);

        for _ in 0..20 {
            interval.record(PollOutcome::Empty);
        }
        assert_eq!(interval.current_ms(), 300_000);
    }

    #[test]
    fn test_activity_resets_empty_streak() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        interval.record(PollOutcome::Empty);
        interval.record(PollOutcome::Empty);
        interval.record(PollOutcome::Activity);
        assert_eq!(interval.empty_polls(), 0);
        assert_eq!(interval.active_polls(), 1);
        assert_eq!(interval.record(PollOutcome::Empty), 15_000);
    }

    #[test]
    fn test_trigger_resets_streak_without_shrinking() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        interval.record(PollOutcome::Empty);
        interval.record(PollOutcome::Empty);
        interval.note_trigger();
        assert_eq!(interval.current_ms(), 30_000);
        assert_eq!(interval.record(PollOutcome::Empty), 30_000);
    }

    #[test]
    fn test_failure_leaves_schedule() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        interval.record(PollOutcome::Empty);
        interval.record(PollOutcome::Failed);
        assert_eq!(interval.empty_polls(), 1);
        assert_eq!(interval.current_ms(), 30_000);
    }

    #[test]
    fn test_requested_interval_never_exceeds_base_at_start() {
        let policy = IntervalPolicy::default();
        let start = |requested: u64| {
            let mut interval = AdaptiveInterval::new(policy);
            interval.rebind([requested])
        };
        assert_eq!(start(0), 30_000);
        assert_eq!(start(120_000), 30_000);
        assert_eq!(start(900_000), 30_000);
        assert_eq!(start(10_000), 10_000);
        assert_eq!(start(1_000), 5_000);
    }

    #[test]
    fn test_rebind_uses_fastest_request() {
        let mut interval = AdaptiveInterval::new(IntervalPolicy::default());
        assert_eq!(interval.rebind([20_000]), 20_000);
        assert_eq!(interval.rebind([20_000, 8_000]), 8_000);

        // A slower channel joining does not slow the job
        assert_eq!(interval.rebind([60_000]), 8_000);
        assert_eq!(interval.rebind([0]), 8_000);
        assert_eq!(interval.rebind(Vec::new()), 8_000);

        assert_eq!(interval.rebind([1]), 5_000);
    }

    proptest! {
        #[test]
        fn prop_interval_stays_within_bounds(
            requested in 0u64..1_000_000,
            outcomes in proptest::collection::vec(0u8..3, 0..200),
            rebinds in proptest::collection::vec(0u64..1_000_000, 0..4),
        ) {
            let policy = IntervalPolicy::default();
            let mut interval = AdaptiveInterval::new(policy);
            prop_assert!(interval.rebind([requested]) <= policy.base_ms);
            if !rebinds.is_empty() {
                interval.rebind(rebinds);
            }
            for o in outcomes {
                let outcome = match o {
                    0 => PollOutcome::Activity,
                    1 => PollOutcome::Empty,
                    _ => PollOutcome::Failed,
                };
                let ms = interval.record(outcome);
                prop_assert!(ms >= policy.min_ms && ms <= policy.max_ms);
            }
        }
    }
}
