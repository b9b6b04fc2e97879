//! Transport configuration and the pacing-rate value type.

use core::time::Duration;

use crate::types::{
    DEFAULT_ACK_DELAY_EXPONENT, DEFAULT_CONNECTION_WINDOW_SIZE, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_INITIAL_RTT, DEFAULT_MAX_STREAMS_BIDIRECTIONAL, DEFAULT_MAX_STREAMS_UNIDIRECTIONAL,
    DEFAULT_MIN_BURST_PACKETS, DEFAULT_PACING_TIMER_TICK_INTERVAL, DEFAULT_QUIC_MAX_BATCH_SIZE,
    DEFAULT_STREAM_WINDOW_SIZE, DEFAULT_UDP_SEND_PACKET_LEN,
    DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT, INIT_CWND_IN_MSS, MIN_CWND_IN_MSS,
    DEFAULT_MAX_CWND_IN_MSS,
};

/// Outbound datagram batching strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicBatchingMode {
    None,
    Gso,
    Sendmmsg,
    SendmmsgGso,
}

/// One pacing quantum: release `burst_size` packets, then wait `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingRate {
    pub interval: Duration,
    pub burst_size: u64,
}

impl PacingRate {
    pub fn new(interval: Duration, burst_size: u64) -> Self {
        Self {
            interval,
            burst_size,
        }
    }
}

/// Per-connection transport knobs.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// The initial connection window advertised to the peer.
    pub advertised_initial_connection_window_size: u64,
    /// The initial per-stream windows advertised to the peer.
    pub advertised_initial_bidi_local_stream_window_size: u64,
    pub advertised_initial_bidi_remote_stream_window_size: u64,
    pub advertised_initial_uni_stream_window_size: u64,
    pub advertised_initial_max_streams_bidi: u64,
    pub advertised_initial_max_streams_uni: u64,
    /// Idle timeout to advertise to the peer.
    pub idle_timeout: Duration,
    /// Ack delay exponent to use for 1-RTT acks.
    pub ack_delay_exponent: u64,
    /// Whether pacing is enabled.
    pub pacing_enabled: bool,
    /// The minimum number of packets to burst out during pacing.
    pub min_burst_packets: u64,
    /// Pacing timer tick interval; RTTs below it disable pacing.
    pub pacing_timer_tick_interval: Duration,
    /// Maximum number of packets one connection write pass may produce.
    pub write_connection_data_packets_limit: u64,
    /// Batching mode for outbound datagrams.
    pub batching_mode: QuicBatchingMode,
    /// Maximum number of packets in one batch. Ignored for `None`.
    pub max_batch_size: u32,
    /// Initial / minimum / maximum congestion windows in MSS.
    pub init_cwnd_in_mss: u64,
    pub min_cwnd_in_mss: u64,
    pub max_cwnd_in_mss: u64,
    /// Whether the partial-reliability extension is negotiated.
    pub partial_reliability_enabled: bool,
    /// Default initial RTT before any sample.
    pub initial_rtt: Duration,
    /// The active_connection_id_limit sent to the peer.
    pub self_active_connection_id_limit: u64,
    /// The UDP payload size written to the socket.
    pub udp_send_packet_len: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            advertised_initial_connection_window_size: DEFAULT_CONNECTION_WINDOW_SIZE,
            advertised_initial_bidi_local_stream_window_size: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_initial_bidi_remote_stream_window_size: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_initial_uni_stream_window_size: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_initial_max_streams_bidi: DEFAULT_MAX_STREAMS_BIDIRECTIONAL,
            advertised_initial_max_streams_uni: DEFAULT_MAX_STREAMS_UNIDIRECTIONAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            pacing_enabled: false,
            min_burst_packets: DEFAULT_MIN_BURST_PACKETS,
            pacing_timer_tick_interval: DEFAULT_PACING_TIMER_TICK_INTERVAL,
            write_connection_data_packets_limit: DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT,
            batching_mode: QuicBatchingMode::None,
            max_batch_size: DEFAULT_QUIC_MAX_BATCH_SIZE,
            init_cwnd_in_mss: INIT_CWND_IN_MSS,
            min_cwnd_in_mss: MIN_CWND_IN_MSS,
            max_cwnd_in_mss: DEFAULT_MAX_CWND_IN_MSS,
            partial_reliability_enabled: false,
            initial_rtt: DEFAULT_INITIAL_RTT,
            self_active_connection_id_limit: 0,
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN as u64,
        }
    }
}
