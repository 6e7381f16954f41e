//! Reconnect backoff.
//!
//! Transport failures and transient authentication rejects feed the same
//! exponential factor: base 5 s, doubling per attempt, exponent capped, delay
//! capped at 5 min, ±20 % jitter. A successful `auth_ok` resets the factor.

use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay: a uniform factor in [0.8, 1.2].
const JITTER: f64 = 0.2;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor_cap: u32,
    reconnects: u32,
    rejects: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, factor_cap: u32) -> Self {
        Self {
            base,
            max,
            factor_cap,
            reconnects: 0,
            rejects: 0,
        }
    }

    /// Count a transport failure or lost connection.
    pub fn record_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    /// Count a transient authentication reject.
    pub fn record_reject(&mut self) {
        self.rejects = self.rejects.saturating_add(1);
    }

    /// Clear both counters after a successful `auth_ok`.
    pub fn reset(&mut self) {
        self.reconnects = 0;
        self.rejects = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.reconnects.saturating_add(self.rejects)
    }

    /// Delay before jitter: base × 2^(attempts-1), exponent and total capped.
    fn base_delay(&self) -> Duration {
        let exponent = self
            .attempts()
            .saturating_sub(1)
            .min(self.factor_cap)
            .min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Next sleep, with ±20 % jitter applied.
    pub fn delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        self.base_delay().mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(5), Duration::from_secs(300), 8)
    }

    #[test]
    fn doubles_per_attempt_until_the_ceiling() {
        let mut b = backoff();
        let mut previous = Duration::ZERO;
        let mut delays = Vec::new();
        for _ in 0..12 {
            b.record_reconnect();
            let delay = b.base_delay();
            assert!(delay >= previous, "backoff must be monotonic");
            assert!(delay <= Duration::from_secs(300), "5 minute ceiling");
            previous = delay;
            delays.push(delay);
        }
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        // 5 * 2^6 = 320 > 300: pinned at the ceiling from the 7th attempt.
        assert_eq!(delays[6], Duration::from_secs(300));
        assert_eq!(delays[11], Duration::from_secs(300));
    }

    #[test]
    fn rejects_and_reconnects_share_the_factor() {
        let mut a = backoff();
        a.record_reconnect();
        a.record_reject();

        let mut b = backoff();
        b.record_reconnect();
        b.record_reconnect();

        assert_eq!(a.attempts(), b.attempts());
        assert_eq!(a.base_delay(), b.base_delay());
    }

    #[test]
    fn exponent_is_capped() {
        let mut uncapped = Backoff::new(Duration::from_millis(1), Duration::from_secs(3600), 8);
        for _ in 0..40 {
            uncapped.record_reconnect();
        }
        // 1ms * 2^8 = 256ms, despite 40 attempts.
        assert_eq!(uncapped.base_delay(), Duration::from_millis(256));
    }

    #[test]
    fn reset_returns_to_the_base() {
        let mut b = backoff();
        for _ in 0..5 {
            b.record_reconnect();
        }
        b.reset();
        assert_eq!(b.attempts(), 0);
        b.record_reconnect();
        assert_eq!(b.base_delay(), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut b = backoff();
        b.record_reconnect();
        let base = b.base_delay();
        for _ in 0..200 {
            let delay = b.delay();
            assert!(delay >= base.mul_f64(0.8));
            assert!(delay <= base.mul_f64(1.2));
        }
    }
}
