//! Per-RTT byte budget for traffic towards an unvalidated peer address,
//! bounding amplification until path validation completes.

use core::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PendingPathRateLimiter {
    credit: u64,
    max_credit: u64,
    last_checked: Option<Instant>,
}

impl PendingPathRateLimiter {
    pub fn new(max_credit: u64) -> Self {
        Self {
            credit: max_credit,
            max_credit,
            last_checked: None,
        }
    }

    /// Remaining credit for the current RTT window; the window resets when
    /// `rtt` has elapsed since the last check.
    pub fn current_credit(&mut self, check_time: Instant, rtt: Duration) -> u64 {
        let expired = match self.last_checked {
            None => true,
            Some(last) => check_time > last + rtt,
        };
        if expired {
            self.last_checked = Some(check_time);
            self.credit = self.max_credit;
        }
        self.credit
    }

    /// Caller must have verified credit covers `sent_bytes`.
    pub fn on_packet_sent(&mut self, sent_bytes: u64) {
        debug_assert!(self.credit >= sent_bytes);
        self.credit = self.credit.saturating_sub(sent_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_grants_full_credit() {
        let mut limiter = PendingPathRateLimiter::new(3000);
        let now = Instant::now();
        assert_eq!(limiter.current_credit(now, Duration::from_millis(100)), 3000);
    }

    #[test]
    fn credit_decrements_within_window() {
        let mut limiter = PendingPathRateLimiter::new(3000);
        let now = Instant::now();
        let rtt = Duration::from_millis(100);
        limiter.current_credit(now, rtt);
        limiter.on_packet_sent(1200);
        assert_eq!(limiter.current_credit(now, rtt), 1800);
        limiter.on_packet_sent(1800);
        assert_eq!(limiter.current_credit(now, rtt), 0);
    }

    #[test]
    fn credit_refills_after_an_rtt() {
        let mut limiter = PendingPathRateLimiter::new(3000);
        let start = Instant::now();
        let rtt = Duration::from_millis(100);
        limiter.current_credit(start, rtt);
        limiter.on_packet_sent(3000);
        assert_eq!(limiter.current_credit(start, rtt), 0);
        let later = start + rtt + Duration::from_millis(1);
        assert_eq!(limiter.current_credit(later, rtt), 3000);
    }
}
