//! Token-bucket write-rate shaping with timer-drift compensation.
//!
//! The pacer converts the congestion controller's `{cwnd, rtt}` view into a
//! `{burst, interval}` schedule via an injected rate calculator. Tokens
//! accumulate on every refresh so credit earned between acks is not lost,
//! and a late-firing pacing timer is compensated by scaling the burst to the
//! actually-elapsed interval.

use core::time::Duration;
use std::time::Instant;

use tracing::warn;

use crate::settings::{PacingRate, TransportSettings};

/// Produces the burst interval length and the number of packets per burst.
pub type PacingRateCalculator =
    Box<dyn Fn(&TransportSettings, u64, u64, Duration) -> PacingRate + Send>;

/// Spreads `cwnd` over the RTT in timer-tick-sized bursts, never below the
/// configured minimum burst.
pub fn calculate_pacing_rate(
    settings: &TransportSettings,
    cwnd_bytes: u64,
    min_cwnd_in_mss: u64,
    rtt: Duration,
) -> PacingRate {
    let mss = settings.udp_send_packet_len.max(1);
    let cwnd_packets = (cwnd_bytes / mss).max(min_cwnd_in_mss);
    let ticks = (rtt.as_micros() / settings.pacing_timer_tick_interval.as_micros().max(1)).max(1)
        as u64;
    let burst_per_tick = (cwnd_packets / ticks).max(settings.min_burst_packets);
    let interval = if burst_per_tick >= cwnd_packets {
        // The whole window fits one burst; pace once per RTT.
        rtt
    } else {
        Duration::from_micros(
            (rtt.as_micros() as u64).saturating_mul(burst_per_tick) / cwnd_packets.max(1),
        )
        .max(settings.pacing_timer_tick_interval)
    };
    PacingRate {
        interval,
        burst_size: burst_per_tick,
    }
}

pub struct Pacer {
    settings: TransportSettings,
    min_cwnd_in_mss: u64,
    batch_size: u64,
    write_interval: Duration,
    scheduled_write_time: Option<Instant>,
    pacing_rate_calculator: PacingRateCalculator,
    cached_batch_size: u64,
    app_limited: bool,
    tokens: u64,
}

impl Pacer {
    pub fn new(settings: TransportSettings, min_cwnd_in_mss: u64) -> Self {
        let limit = settings.write_connection_data_packets_limit;
        Self {
            settings,
            min_cwnd_in_mss,
            batch_size: limit,
            write_interval: Duration::ZERO,
            scheduled_write_time: None,
            pacing_rate_calculator: Box::new(calculate_pacing_rate),
            cached_batch_size: limit,
            app_limited: false,
            tokens: limit,
        }
    }

    pub fn set_pacing_rate_calculator(&mut self, calculator: PacingRateCalculator) {
        self.pacing_rate_calculator = calculator;
    }

    pub fn set_app_limited(&mut self, limited: bool) {
        self.app_limited = limited;
    }

    /// Recomputes the pacing schedule. An RTT below the timer tick interval
    /// cannot be paced; fall back to the plain write limit. Tokens
    /// accumulate across refreshes.
    ///
    /// Returns the new `{burst, interval}` pair for the caller's event log.
    pub fn refresh_pacing_rate(&mut self, cwnd_bytes: u64, rtt: Duration) -> PacingRate {
        if rtt < self.settings.pacing_timer_tick_interval {
            self.write_interval = Duration::ZERO;
            self.batch_size = self.settings.write_connection_data_packets_limit;
        } else {
            let pacing_rate =
                (self.pacing_rate_calculator)(&self.settings, cwnd_bytes, self.min_cwnd_in_mss, rtt);
            self.write_interval = pacing_rate.interval;
            self.batch_size = pacing_rate.burst_size;
            self.tokens += self.batch_size;
        }
        self.cached_batch_size = self.batch_size;
        PacingRate {
            interval: self.write_interval,
            burst_size: self.batch_size,
        }
    }

    /// Records when the pacing timer was armed, for drift compensation at
    /// fire time.
    pub fn on_paced_write_scheduled(&mut self, current_time: Instant) {
        self.scheduled_write_time = Some(current_time);
    }

    pub fn on_packet_sent(&mut self) {
        self.tokens = self.tokens.saturating_sub(1);
    }

    pub fn on_packets_loss(&mut self) {
        self.tokens = 0;
    }

    pub fn time_until_next_write(&self) -> Duration {
        if self.app_limited || self.tokens > 0 {
            Duration::ZERO
        } else {
            self.write_interval
        }
    }

    /// Number of packets this write pass may produce. Clears the scheduled
    /// write stamp. A timer that fired late earns proportionally more
    /// tokens; unused credit from earlier passes is retained.
    pub fn update_and_get_write_batch_size(&mut self, current_time: Instant) -> u64 {
        let scheduled_write_time = self.scheduled_write_time.take();
        if self.app_limited {
            self.cached_batch_size = self.settings.write_connection_data_packets_limit;
            return self.cached_batch_size;
        }
        if self.write_interval.is_zero() {
            return self.batch_size;
        }
        let Some(scheduled) = scheduled_write_time else {
            return self.tokens;
        };
        if scheduled >= current_time {
            return self.tokens;
        }
        let adjusted_interval = current_time.duration_since(scheduled) + self.write_interval;
        self.cached_batch_size = div_ceil_u128(
            adjusted_interval.as_micros() * u128::from(self.batch_size),
            self.write_interval.as_micros(),
        );
        if self.cached_batch_size < self.batch_size {
            warn!("pacer batch size calculation: cached batch size below batch size");
        }
        self.tokens += self.cached_batch_size.saturating_sub(self.batch_size);
        self.tokens
    }

    pub fn cached_write_batch_size(&self) -> u64 {
        self.cached_batch_size
    }
}

fn div_ceil_u128(numerator: u128, denominator: u128) -> u64 {
    ((numerator + denominator - 1) / denominator) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TransportSettings;

    fn test_settings() -> TransportSettings {
        TransportSettings {
            pacing_timer_tick_interval: Duration::from_micros(1),
            ..TransportSettings::default()
        }
    }

    fn consume_tokens(pacer: &mut Pacer, tokens_to_consume: u64) {
        for _ in 0..tokens_to_consume {
            pacer.on_packet_sent();
        }
    }

    fn fixed_rate(interval: Duration, burst: u64) -> PacingRateCalculator {
        Box::new(move |_, _, _, _| PacingRate::new(interval, burst))
    }

    #[test]
    fn write_before_scheduled() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), limit);
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
    }

    #[test]
    fn rate_calculator_tokens_accumulate() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_micros(1234), 4321));
        pacer.refresh_pacing_rate(200_000, Duration::from_micros(200));
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(
            pacer.update_and_get_write_batch_size(Instant::now()),
            4321 + limit
        );
        consume_tokens(&mut pacer, 4321 + limit);
        assert_eq!(pacer.time_until_next_write(), Duration::from_micros(1234));
    }

    #[test]
    fn compensate_timer_drift() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_micros(1000), 10));
        let current_time = Instant::now();
        pacer.refresh_pacing_rate(20, Duration::from_micros(100));
        pacer.on_paced_write_scheduled(current_time);
        // Timer fired a full interval late: one extra burst of credit.
        assert_eq!(
            pacer.update_and_get_write_batch_size(current_time + Duration::from_micros(1000)),
            20 + limit
        );
        // Without a new schedule there is no further compensation, but the
        // tokens keep the last one.
        assert_eq!(
            pacer.update_and_get_write_batch_size(current_time + Duration::from_micros(2000)),
            20 + limit
        );
        consume_tokens(&mut pacer, 3);
        assert_eq!(
            pacer.update_and_get_write_batch_size(current_time + Duration::from_micros(2000)),
            20 + limit - 3
        );
    }

    #[test]
    fn next_write_time() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);

        pacer.set_pacing_rate_calculator(Box::new(|_, _, _, rtt| PacingRate::new(rtt, 10)));
        pacer.refresh_pacing_rate(20, Duration::from_micros(1000));
        // Right after a refresh one can always write.
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);

        consume_tokens(&mut pacer, 10 + limit);
        assert_eq!(pacer.time_until_next_write(), Duration::from_micros(1000));
    }

    #[test]
    fn impossible_to_pace() {
        let mut settings = test_settings();
        settings.pacing_timer_tick_interval = Duration::from_millis(1);
        let limit = settings.write_connection_data_packets_limit;
        let udp_len = settings.udp_send_packet_len;
        let mut pacer = Pacer::new(settings, 2);
        pacer.set_pacing_rate_calculator(Box::new(move |settings, cwnd_bytes, _, rtt| {
            PacingRate::new(rtt, cwnd_bytes / settings.udp_send_packet_len)
        }));
        // RTT below the tick interval: pacing is disabled.
        pacer.refresh_pacing_rate(200 * udp_len, Duration::from_micros(100));
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), limit);
    }

    #[test]
    fn cached_batch_size() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let udp_len = settings.udp_send_packet_len;
        let mut pacer = Pacer::new(settings, 2);
        assert_eq!(pacer.cached_write_batch_size(), limit);
        pacer.set_pacing_rate_calculator(Box::new(move |settings, cwnd_bytes, _, rtt| {
            PacingRate::new(rtt, cwnd_bytes / settings.udp_send_packet_len * 2)
        }));
        pacer.refresh_pacing_rate(20 * udp_len, Duration::from_millis(100));
        assert_eq!(pacer.cached_write_batch_size(), 40);

        let current_time = Instant::now();
        pacer.on_paced_write_scheduled(current_time);
        pacer.update_and_get_write_batch_size(current_time);
        assert_eq!(pacer.cached_write_batch_size(), 40);

        pacer.on_paced_write_scheduled(current_time + Duration::from_millis(100));
        pacer.update_and_get_write_batch_size(current_time + Duration::from_millis(200));
        assert_eq!(pacer.cached_write_batch_size(), 80);
    }

    #[test]
    fn app_limited_returns_write_limit() {
        let mut settings = test_settings();
        settings.write_connection_data_packets_limit = 12;
        let mut pacer = Pacer::new(settings, 2);
        pacer.set_app_limited(true);
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), 12);
    }

    #[test]
    fn tokens_lifecycle() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        // Tokens are available right after init.
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), limit);

        consume_tokens(&mut pacer, limit);

        // 10 packets per 10ms.
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(10), 10));
        pacer.refresh_pacing_rate(100, Duration::from_millis(100));

        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), 10);

        consume_tokens(&mut pacer, 10);
        assert_eq!(pacer.time_until_next_write(), Duration::from_millis(10));
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), 0);

        // Schedule, then fire exactly one interval later: a full burst.
        let cur_time = Instant::now();
        pacer.on_paced_write_scheduled(cur_time);
        assert_eq!(
            pacer.update_and_get_write_batch_size(cur_time + Duration::from_millis(10)),
            10
        );

        // Schedule again; the previous tokens were not consumed.
        pacer.on_paced_write_scheduled(cur_time + Duration::from_millis(10));
        assert_eq!(
            pacer.update_and_get_write_batch_size(cur_time + Duration::from_millis(20)),
            20
        );
    }

    #[test]
    fn tokens_never_go_negative() {
        let settings = test_settings();
        let limit = settings.write_connection_data_packets_limit;
        let mut pacer = Pacer::new(settings, 2);
        consume_tokens(&mut pacer, limit + 50);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(10), 10));
        pacer.refresh_pacing_rate(100, Duration::from_millis(100));
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), 10);
    }

    #[test]
    fn loss_zeroes_tokens() {
        let settings = test_settings();
        let mut pacer = Pacer::new(settings, 2);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(10), 10));
        pacer.refresh_pacing_rate(100, Duration::from_millis(100));
        pacer.on_packets_loss();
        assert_eq!(pacer.update_and_get_write_batch_size(Instant::now()), 0);
        assert_eq!(pacer.time_until_next_write(), Duration::from_millis(10));
    }
}
