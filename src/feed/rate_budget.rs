use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

const AVAILABILITY_SLACK: Duration = Duration::from_millis(1);

/// Extra delay applied after the server reports a rate-limit violation,
/// doubling per consecutive violation.
#[derive(Debug, Clone)]
pub struct ViolationBackoff {
    base: Duration,
    max: Duration,
    violations: u32,
    blocked_until: Option<Instant>,
}

impl ViolationBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            violations: 0,
            blocked_until: None,
        }
    }

    pub fn delay_for(&self, violations: u32) -> Duration {
        if violations == 0 {
            return Duration::ZERO;
        }
        let exponent = (violations - 1).min(20);
        self.base.saturating_mul(1_u32 << exponent).min(self.max)
    }

    pub fn record(&mut self, now: Instant, server_delay: Option<Duration>) -> Duration {
        self.violations = self.violations.saturating_add(1);
        let delay = self
            .delay_for(self.violations)
            .max(server_delay.unwrap_or_default());
        self.blocked_until = Some(now + delay);
        delay
    }

    pub fn clear(&mut self) {
        self.violations = 0;
        self.blocked_until = None;
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }
}

/// Fixed-window counter: at most `limit` units may be consumed per window.
/// The window rolls lazily on the first attempt after it has expired.
#[derive(Debug, Clone)]
pub struct RateBudget {
    name: &'static str,
    limit: u32,
    window: Duration,
    used: u32,
    reset_at: Instant,
    backoff: ViolationBackoff,
}

impl RateBudget {
    pub fn new(
        name: &'static str,
        limit: u32,
        window: Duration,
        backoff: ViolationBackoff,
        now: Instant,
    ) -> Self {
        Self {
            name,
            limit,
            window,
            used: 0,
            reset_at: now + window,
            backoff,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now > self.reset_at {
            self.used = 0;
            self.reset_at = now + self.window;
        }
    }

    pub fn try_consume(&mut self, cost: u32, now: Instant) -> bool {
        if !self.backoff.remaining(now).is_zero() {
            return false;
        }

        self.roll_window(now);
        match self.used.checked_add(cost) {
            Some(next) if next <= self.limit => {
                self.used = next;
                true
            }
            _ => false,
        }
    }

    pub fn time_until_reset(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }

    /// How long a caller should wait before `try_consume(cost)` can succeed.
    pub fn time_until_available(&self, cost: u32, now: Instant) -> Duration {
        let blocked = self.backoff.remaining(now);
        let window_expired = now > self.reset_at;
        let fits = self
            .used
            .checked_add(cost)
            .is_some_and(|next| next <= self.limit);

        if window_expired || fits {
            blocked
        } else {
            blocked.max(self.time_until_reset(now) + AVAILABILITY_SLACK)
        }
    }

    pub fn record_violation(&mut self, now: Instant, server_delay: Option<Duration>) -> Duration {
        let delay = self.backoff.record(now, server_delay);
        warn!(
            budget = self.name,
            violations = self.backoff.violations(),
            delay_ms = delay.as_millis() as u64,
            "server reported rate limit, backing off"
        );
        delay
    }

    pub fn clear_violations(&mut self) {
        self.backoff.clear();
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: u32, now: Instant) -> RateBudget {
        RateBudget::new(
            "test",
            limit,
            Duration::from_secs(60),
            ViolationBackoff::new(Duration::from_secs(1), Duration::from_secs(8)),
            now,
        )
    }

    #[test]
    fn rejects_the_send_past_the_limit_without_mutating() {
        let now = Instant::now();
        let mut budget = budget(2, now);

        assert!(budget.try_consume(1, now));
        assert!(budget.try_consume(1, now));
        assert!(!budget.try_consume(1, now));
        assert_eq!(budget.used(), 2);
    }

    #[test]
    fn partial_cost_that_would_overflow_is_rejected() {
        let now = Instant::now();
        let mut budget = budget(10, now);

        assert!(budget.try_consume(8, now));
        assert!(!budget.try_consume(3, now));
        assert!(budget.try_consume(2, now));
    }

    #[test]
    fn window_resets_only_after_it_has_passed() {
        let now = Instant::now();
        let mut budget = budget(1, now);
        assert!(budget.try_consume(1, now));

        let at_boundary = now + Duration::from_secs(60);
        assert!(!budget.try_consume(1, at_boundary));

        let wait = budget.time_until_available(1, now);
        assert_eq!(wait, Duration::from_secs(60) + AVAILABILITY_SLACK);
        assert!(budget.try_consume(1, now + wait));
        assert_eq!(budget.used(), 1);
    }

    #[test]
    fn violation_backoff_doubles_and_caps() {
        let backoff = ViolationBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays = (1..=6)
            .map(|violations| backoff.delay_for(violations))
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            [1, 2, 4, 8, 8, 8].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn violation_blocks_consumption_until_backoff_elapses() {
        let now = Instant::now();
        let mut budget = budget(100, now);

        let delay = budget.record_violation(now, None);
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!budget.try_consume(1, now + Duration::from_millis(500)));
        assert!(budget.try_consume(1, now + delay));
    }

    #[test]
    fn server_supplied_delay_wins_when_longer() {
        let now = Instant::now();
        let mut budget = budget(100, now);

        let delay = budget.record_violation(now, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(budget.time_until_available(1, now), Duration::from_secs(5));

        budget.clear_violations();
        assert!(budget.try_consume(1, now));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_the_reported_time_refills_the_window() {
        let mut budget = budget(2, Instant::now());
        assert!(budget.try_consume(2, Instant::now()));
        assert!(!budget.try_consume(1, Instant::now()));

        let wait = budget.time_until_available(1, Instant::now());
        assert!(wait > Duration::from_secs(59));
        tokio::time::advance(wait).await;

        assert!(budget.try_consume(1, Instant::now()));
        assert_eq!(budget.used(), 1);
    }
}
