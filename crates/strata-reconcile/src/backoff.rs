//! Exponential backoff with a ceiling.

use std::time::Duration;

/// Doubling delay, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            attempts: 0,
        }
    }

    /// Delay between watch reconnects: 1s doubling to 5 minutes.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    /// Return the delay to wait now and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) would return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(b.attempts(), 5);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::reconnect();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.peek(), Duration::from_secs(1));
        assert_eq!(b.attempts(), 0);
    }

    #[test]
    fn reconnect_caps_at_five_minutes() {
        let mut b = Backoff::reconnect();
        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.peek(), Duration::from_secs(300));
    }
}
