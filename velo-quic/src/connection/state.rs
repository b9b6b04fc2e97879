//! Connection-state glue.
//!
//! [`QuicConnectionState`] owns everything the transmission pipeline and the
//! simple-frame processor operate on: outstanding packets and their clone
//! events, pending events for the outer loop, the stream manager, the
//! peer-connection-id set and the transport settings. All state is owned by
//! one reactor thread; helpers take `&mut QuicConnectionState` and never keep
//! a long-lived reference.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use core::time::Duration;

use crate::connection::streams::{StreamBuffer, StreamManager};
use crate::frames::types::{PathChallengeFrame, SimpleFrame};
use crate::packet::RegularWritePacket;
use crate::qlog::QLogger;
use crate::settings::TransportSettings;
use crate::stats::TransportStatsCallback;
use crate::types::{
    ConnectionId, ConnectionIdData, PacketNum, PacketNumberSpace, QuicNodeType, QuicVersion,
    DEFAULT_UDP_SEND_PACKET_LEN,
};

/// Identifier shared by an original packet and all of its PTO-driven clones,
/// keyed by the original packet number.
pub type PacketEvent = PacketNum;

/// Bookkeeping for one sent, not-yet-acknowledged packet.
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet: RegularWritePacket,
    pub time: Instant,
    /// Bytes this packet put in flight.
    pub encoded_size: u64,
    pub is_handshake: bool,
    /// Present iff this packet was cloned (or is itself a clone); points into
    /// `QuicConnectionState::outstanding_packet_events`.
    pub associated_event: Option<PacketEvent>,
}

impl OutstandingPacket {
    pub fn new(
        packet: RegularWritePacket,
        time: Instant,
        encoded_size: u64,
        is_handshake: bool,
    ) -> Self {
        Self {
            packet,
            time,
            encoded_size,
            is_handshake,
            associated_event: None,
        }
    }
}

/// Events the outer event loop drains each turn: frames to write, timers to
/// schedule or cancel.
#[derive(Debug, Default)]
pub struct PendingEvents {
    pub frames: Vec<SimpleFrame>,
    /// Challenge waiting to be written for a new path.
    pub path_challenge: Option<PathChallengeFrame>,
    pub schedule_path_validation_timeout: bool,
    pub cancel_ping_timeout: bool,
}

/// Send/receive packet-number bookkeeping for one number space.
#[derive(Debug, Default, Clone)]
pub struct AckState {
    pub largest_acked_by_peer: Option<PacketNum>,
    pub largest_received: Option<PacketNum>,
    pub next_packet_num: PacketNum,
}

#[derive(Debug, Default, Clone)]
pub struct AckStates {
    pub initial: AckState,
    pub handshake: AckState,
    pub app_data: AckState,
}

impl AckStates {
    pub fn for_space(&self, space: PacketNumberSpace) -> &AckState {
        match space {
            PacketNumberSpace::Initial => &self.initial,
            PacketNumberSpace::Handshake => &self.handshake,
            PacketNumberSpace::AppData => &self.app_data,
        }
    }

    pub fn for_space_mut(&mut self, space: PacketNumberSpace) -> &mut AckState {
        match space {
            PacketNumberSpace::Initial => &mut self.initial,
            PacketNumberSpace::Handshake => &mut self.handshake,
            PacketNumberSpace::AppData => &mut self.app_data,
        }
    }

    /// Assigns the next send packet number for `space`. Strictly increasing,
    /// never reused.
    pub fn next_packet_num(&mut self, space: PacketNumberSpace) -> PacketNum {
        let state = self.for_space_mut(space);
        let num = state.next_packet_num;
        state.next_packet_num += 1;
        num
    }
}

/// Connection-level flow control counters the core consults when re-deriving
/// MAX_DATA limits.
#[derive(Debug, Default, Clone)]
pub struct ConnectionFlowControlState {
    pub sum_cur_read_offset: u64,
    pub sum_cur_write_offset: u64,
    pub window_size: u64,
    pub advertised_max_offset: u64,
    pub peer_advertised_max_offset: u64,
}

/// RTT estimate per RFC 6298-style smoothing.
#[derive(Debug, Clone)]
pub struct RttState {
    pub srtt: Duration,
    pub rttvar: Duration,
    pub lrtt: Duration,
    pub mrtt: Duration,
}

impl Default for RttState {
    fn default() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            lrtt: Duration::ZERO,
            mrtt: Duration::MAX,
        }
    }
}

/// The 1-RTT crypto stream's retransmission state; handshake-space crypto
/// stays with the handshake layer and is never cloned.
#[derive(Debug, Default)]
pub struct CryptoStream {
    pub retransmission_buffer: BTreeMap<u64, StreamBuffer>,
}

#[derive(Debug, Default)]
pub struct CryptoState {
    pub one_rtt_stream: CryptoStream,
}

pub struct QuicConnectionState {
    pub node_type: QuicNodeType,
    pub version: QuicVersion,
    pub client_connection_id: Option<ConnectionId>,
    pub server_connection_id: Option<ConnectionId>,
    /// All peer connection ids, the initial one included.
    pub peer_connection_ids: Vec<ConnectionIdData>,
    pub transport_settings: TransportSettings,
    pub udp_send_packet_len: u64,
    pub streams: StreamManager,
    pub crypto_state: CryptoState,
    pub flow_control: ConnectionFlowControlState,
    pub ack_states: AckStates,
    pub rtt_state: RttState,
    pub outstanding_packets: Vec<OutstandingPacket>,
    /// Clone events of packets still outstanding; see
    /// [`OutstandingPacket::associated_event`].
    pub outstanding_packet_events: HashSet<PacketEvent>,
    pub outstanding_cloned_packets_count: usize,
    pub pending_events: PendingEvents,
    /// The challenge currently awaiting a PATH_RESPONSE.
    pub outstanding_path_validation: Option<PathChallengeFrame>,
    pub path_challenge_start_time: Option<Instant>,
    pub qlogger: Option<Box<dyn QLogger>>,
    pub stats_callback: Option<Box<dyn TransportStatsCallback>>,
}

impl QuicConnectionState {
    pub fn new(node_type: QuicNodeType) -> Self {
        let transport_settings = TransportSettings::default();
        Self {
            node_type,
            version: QuicVersion::QUIC_V1,
            client_connection_id: None,
            server_connection_id: None,
            peer_connection_ids: Vec::new(),
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN as u64,
            streams: StreamManager::new(),
            crypto_state: CryptoState::default(),
            flow_control: ConnectionFlowControlState {
                window_size: transport_settings.advertised_initial_connection_window_size,
                ..ConnectionFlowControlState::default()
            },
            ack_states: AckStates::default(),
            rtt_state: RttState::default(),
            outstanding_packets: Vec::new(),
            outstanding_packet_events: HashSet::new(),
            outstanding_cloned_packets_count: 0,
            pending_events: PendingEvents::default(),
            outstanding_path_validation: None,
            path_challenge_start_time: None,
            qlogger: None,
            stats_callback: None,
            transport_settings,
        }
    }

    /// The connection id we currently address the peer with.
    pub fn peer_connection_id(&self) -> Option<&ConnectionId> {
        match self.node_type {
            QuicNodeType::Client => self.server_connection_id.as_ref(),
            QuicNodeType::Server => self.client_connection_id.as_ref(),
        }
    }

    fn set_peer_connection_id(&mut self, conn_id: ConnectionId) {
        match self.node_type {
            QuicNodeType::Client => self.server_connection_id = Some(conn_id),
            QuicNodeType::Server => self.client_connection_id = Some(conn_id),
        }
    }

    /// Switches to an unused peer connection id and queues retirement of the
    /// old one. Returns false when no unused id remains.
    pub fn retire_and_switch_peer_connection_ids(&mut self) -> bool {
        let Some(current) = self.peer_connection_id().copied() else {
            return false;
        };
        let Some(next) = self
            .peer_connection_ids
            .iter()
            .find(|data| data.conn_id != current)
            .cloned()
        else {
            return false;
        };
        if let Some(pos) = self
            .peer_connection_ids
            .iter()
            .position(|data| data.conn_id == current)
        {
            let retired = self.peer_connection_ids.remove(pos);
            self.pending_events.frames.push(SimpleFrame::RetireConnectionId(
                crate::frames::types::RetireConnectionIdFrame {
                    sequence_number: retired.sequence_number,
                },
            ));
        }
        self.set_peer_connection_id(next.conn_id);
        true
    }

    /// Largest packet number the peer has acknowledged in `space`, or the
    /// number we are about to send when nothing was acknowledged yet.
    pub fn largest_acked_by_peer(&self, space: PacketNumberSpace) -> PacketNum {
        self.ack_states
            .for_space(space)
            .largest_acked_by_peer
            .unwrap_or(0)
    }

    /// Removes an acknowledged packet from the outstanding set. Returns the
    /// packet with a flag saying whether its frames should be processed:
    /// within a clone group only the first acknowledged member is processed;
    /// its event is erased so later-arriving siblings are deduplicated.
    pub fn ack_outstanding_packet(
        &mut self,
        space: PacketNumberSpace,
        packet_num: PacketNum,
    ) -> Option<(OutstandingPacket, bool)> {
        let index = self.outstanding_packets.iter().position(|outstanding| {
            outstanding.packet.header.packet_number_space() == space
                && outstanding.packet.header.packet_sequence_num() == packet_num
        })?;
        let packet = self.outstanding_packets.remove(index);
        let process_frames = match packet.associated_event {
            Some(event) => {
                self.outstanding_cloned_packets_count =
                    self.outstanding_cloned_packets_count.saturating_sub(1);
                self.outstanding_packet_events.remove(&event)
            }
            None => true,
        };
        Some((packet, process_frames))
    }
}

/// Updates the RTT estimate with a new sample. `ack_delay` is subtracted when
/// doing so cannot push the sample below the observed minimum.
pub fn update_rtt(conn: &mut QuicConnectionState, mut sample: Duration, ack_delay: Duration) {
    let rtt = &mut conn.rtt_state;
    rtt.lrtt = sample;
    if sample < rtt.mrtt {
        rtt.mrtt = sample;
    }
    if sample > ack_delay && sample - ack_delay >= rtt.mrtt {
        sample -= ack_delay;
    }
    if rtt.srtt == Duration::ZERO {
        rtt.srtt = sample;
        rtt.rttvar = sample / 2;
    } else {
        let delta = if rtt.srtt > sample {
            rtt.srtt - sample
        } else {
            sample - rtt.srtt
        };
        rtt.rttvar = (rtt.rttvar * 3 + delta) / 4;
        rtt.srtt = (rtt.srtt * 7 + sample) / 8;
    }
    let (lrtt, mrtt, srtt) = (rtt.lrtt, rtt.mrtt, rtt.srtt);
    if let Some(qlogger) = conn.qlogger.as_mut() {
        qlogger.add_metric_update(lrtt, mrtt, srtt, ack_delay);
    }
}
