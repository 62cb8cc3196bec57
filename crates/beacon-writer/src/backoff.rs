use std::time::{Duration, Instant};

/// Tracks the drain worker's exponential backoff after a failed sink write.
/// `backoff == 0` means "connected, quiet"; any nonzero value means
/// "not-yet-verified / backing off", doubling from 1 up to a ceiling of 255.
///
/// Starts at 1 rather than 0: a sink is treated as "not yet verified" until
/// its first successful write, so that write reports a "connected" event
/// the same way a write following a real failure does.
#[derive(Debug)]
pub struct BackoffState {
    last_failure: Option<Instant>,
    backoff_secs: u8,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self { last_failure: None, backoff_secs: 1 }
    }
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.backoff_secs
    }

    pub fn should_delay(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(t) => now.saturating_duration_since(t) < Duration::from_secs(u64::from(self.backoff_secs)),
            None => false,
        }
    }

    /// Records a failed attempt, doubling the backoff (or seeding it at 1)
    /// and capping at 255. Returns the new backoff for logging.
    pub fn record_failure(&mut self, now: Instant) -> u8 {
        self.last_failure = Some(now);
        self.backoff_secs =
            if self.backoff_secs == 0 { 1 } else { self.backoff_secs.saturating_mul(2) };
        self.backoff_secs
    }

    /// Records a successful attempt. Returns `true` if this is the first
    /// success after a period of backing off (i.e. a "connected" event
    /// should be logged).
    pub fn record_success(&mut self) -> bool {
        let was_backing_off = self.backoff_secs != 0;
        self.backoff_secs = 0;
        self.last_failure = None;
        was_backing_off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_255() {
        // A fresh state already carries backoff == 1, so the first failure
        // doubles it to 2 rather than seeding it.
        let mut b = BackoffState::new();
        let now = Instant::now();
        assert_eq!(b.record_failure(now), 2);
        assert_eq!(b.record_failure(now), 4);
        assert_eq!(b.record_failure(now), 8);
        for _ in 0..10 {
            b.record_failure(now);
        }
        assert_eq!(b.current(), 255);
    }

    #[test]
    fn success_clears_backoff_and_reports_transition() {
        let mut b = BackoffState::new();
        let now = Instant::now();
        b.record_failure(now);
        assert!(b.record_success());
        assert_eq!(b.current(), 0);
        assert!(!b.record_success());
    }

    #[test]
    fn first_success_on_a_fresh_sink_is_reported_as_connected() {
        // A sink that has never failed is still "unverified" until its
        // first write succeeds, so that write must report a transition.
        let mut b = BackoffState::new();
        assert_eq!(b.current(), 1);
        assert!(b.record_success());
        assert_eq!(b.current(), 0);
    }
}
