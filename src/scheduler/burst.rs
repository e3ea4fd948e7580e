//! Emotional burst rule: while arousal stays high the character keeps talking,
//! a few times at most, then cools down.

use std::time::Duration;
use tokio::time::Instant;

pub const BURST_PROMPTS: [&str; 3] = [
    "You still have more to say. Keep expressing how you feel and add a line or two naturally.",
    "You're not quite done with this thought. Say a little more about it.",
    "There's something else you want to add. Keep it short.",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstPolicy {
    pub arousal_threshold: f64,
    pub max_bursts: u32,
    pub cooldown: Duration,
    /// Pause before a follow-up is sent
    pub delay: Duration,
}

impl Default for BurstPolicy {
    fn default() -> Self {
        Self {
            arousal_threshold: 0.7,
            max_bursts: 3,
            cooldown: Duration::from_secs(30),
            delay: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BurstTracker {
    policy: BurstPolicy,
    count: u32,
    cooldown_until: Option<Instant>,
}

impl BurstTracker {
    pub fn new(policy: BurstPolicy) -> Self {
        Self { policy, count: 0, cooldown_until: None }
    }

    pub fn policy(&self) -> &BurstPolicy {
        &self.policy
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Decide whether to send another follow-up after a turn.
    ///
    /// Returns the follow-up prompt when the rule fires. When it does not fire
    /// after one or more bursts, the cooldown starts and the counter resets.
    pub fn evaluate(&mut self, arousal: f64, now: Instant) -> Option<&'static str> {
        let cooled_down = self.cooldown_until.map_or(true, |until| now >= until);

        if arousal >= self.policy.arousal_threshold && self.count < self.policy.max_bursts && cooled_down {
            let prompt = BURST_PROMPTS[self.count as usize % BURST_PROMPTS.len()];
            self.count += 1;
            return Some(prompt);
        }

        if self.count > 0 {
            self.cooldown_until = Some(now + self.policy.cooldown);
            self.count = 0;
        }
        None
    }

    /// The user spoke; the next high-arousal stretch starts a fresh burst.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for BurstTracker {
    fn default() -> Self {
        Self::new(BurstPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_caps_and_cools_down() {
        let mut tracker = BurstTracker::default();
        let start = Instant::now();

        let fired: Vec<_> = (0..3).filter_map(|_| tracker.evaluate(0.9, start)).collect();
        assert_eq!(fired, BURST_PROMPTS.to_vec());

        // cap reached: cooldown begins, nothing fires while it runs
        assert_eq!(tracker.evaluate(0.9, start), None);
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.evaluate(0.9, start + Duration::from_secs(29)), None);

        assert!(tracker.evaluate(0.9, start + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_low_arousal_never_fires() {
        let mut tracker = BurstTracker::default();
        let now = Instant::now();
        assert_eq!(tracker.evaluate(0.69, now), None);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_dropping_below_threshold_starts_cooldown() {
        let mut tracker = BurstTracker::default();
        let start = Instant::now();

        assert!(tracker.evaluate(0.8, start).is_some());
        assert_eq!(tracker.evaluate(0.3, start + Duration::from_secs(1)), None);
        assert_eq!(tracker.evaluate(0.8, start + Duration::from_secs(10)), None);
        assert!(tracker.evaluate(0.8, start + Duration::from_secs(31)).is_some());
    }

    #[test]
    fn test_user_activity_resets_count() {
        let mut tracker = BurstTracker::default();
        let now = Instant::now();
        tracker.evaluate(0.9, now);
        tracker.evaluate(0.9, now);
        tracker.reset();
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.evaluate(0.9, now), Some(BURST_PROMPTS[0]));
    }
}
