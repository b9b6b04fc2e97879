//! Structured event log in the qlog JSON schema.
//!
//! Every transport observation is mirrored to an injectable [`QLogger`].
//! Events carry a relative microsecond timestamp, a category, the event
//! name, a trigger (always `"DEFAULT"` today) and an event-specific data
//! object. [`FileQLogger`] accumulates events and renders the full qlog
//! document.

use core::time::Duration;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;

use crate::frames::types::{SimpleFrame, WriteFrame};
use crate::packet::{PacketHeader, ProtectionType, RegularPacket, RegularWritePacket};
use crate::types::{PacketNum, StreamId};

pub const QLOG_VERSION: &str = "draft-00";
pub const HTTP3_PROTOCOL_TYPE: &str = "QUIC_HTTP3";
pub const MVFST_PROTOCOL_TYPE: &str = "QUIC";
pub const DEFAULT_TRIGGER: &str = "DEFAULT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VantagePoint {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QLogCategory {
    Transport,
    Recovery,
    Loss,
    MetricUpdate,
    Connectivity,
    Http3,
    AppLimitedUpdate,
    IdleUpdate,
    BandwidthEstUpdate,
}

impl QLogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            QLogCategory::Transport => "TRANSPORT",
            QLogCategory::Recovery => "RECOVERY",
            QLogCategory::Loss => "LOSS",
            QLogCategory::MetricUpdate => "METRIC_UPDATE",
            QLogCategory::Connectivity => "CONNECTIVITY",
            QLogCategory::Http3 => "HTTP3",
            QLogCategory::AppLimitedUpdate => "APP_LIMITED_UPDATE",
            QLogCategory::IdleUpdate => "IDLE_UPDATE",
            QLogCategory::BandwidthEstUpdate => "BANDWIDTH_EST_UPDATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QLogEventType {
    PacketSent,
    PacketReceived,
    ConnectionClose,
    TransportSummary,
    CongestionMetricUpdate,
    PacingMetricUpdate,
    PacingObservation,
    AppLimitedUpdate,
    AppIdleUpdate,
    BandwidthEstUpdate,
    PacketDrop,
    DatagramReceived,
    LossAlarm,
    PacketsLost,
    TransportStateUpdate,
    PacketBuffered,
    PacketAck,
    MetricUpdate,
    StreamStateUpdate,
    ConnectionMigration,
    PathValidation,
}

impl QLogEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            QLogEventType::PacketSent => "PACKET_SENT",
            QLogEventType::PacketReceived => "PACKET_RECEIVED",
            QLogEventType::ConnectionClose => "CONNECTION_CLOSE",
            QLogEventType::TransportSummary => "TRANSPORT_SUMMARY",
            QLogEventType::CongestionMetricUpdate => "CONGESTION_METRIC_UPDATE",
            QLogEventType::PacingMetricUpdate => "PACING_METRIC_UPDATE",
            QLogEventType::PacingObservation => "PACING_OBSERVATION",
            QLogEventType::AppLimitedUpdate => "APP_LIMITED_UPDATE",
            QLogEventType::AppIdleUpdate => "APP_IDLE_UPDATE",
            QLogEventType::BandwidthEstUpdate => "BANDWIDTH_EST_UPDATE",
            QLogEventType::PacketDrop => "PACKET_DROP",
            QLogEventType::DatagramReceived => "DATAGRAM_RECEIVED",
            QLogEventType::LossAlarm => "LOSS_ALARM",
            QLogEventType::PacketsLost => "PACKETS_LOST",
            QLogEventType::TransportStateUpdate => "TRANSPORT_STATE_UPDATE",
            QLogEventType::PacketBuffered => "PACKET_BUFFERED",
            QLogEventType::PacketAck => "PACKET_ACK",
            QLogEventType::MetricUpdate => "METRIC_UPDATE",
            QLogEventType::StreamStateUpdate => "STREAM_STATE_UPDATE",
            QLogEventType::ConnectionMigration => "CONNECTION_MIGRATION",
            QLogEventType::PathValidation => "PATH_VALIDATION",
        }
    }
}

/// One logged event.
#[derive(Debug, Clone)]
pub struct QLogEvent {
    pub reference_time_us: u64,
    pub category: QLogCategory,
    pub event_type: QLogEventType,
    pub trigger: String,
    pub data: Value,
}

impl QLogEvent {
    pub fn to_json(&self) -> Value {
        json!([
            self.reference_time_us.to_string(),
            self.category.as_str(),
            self.event_type.as_str(),
            self.trigger,
            self.data,
        ])
    }
}

fn write_frame_to_json(frame: &WriteFrame) -> Value {
    match frame {
        WriteFrame::Padding(_) => json!({ "frame_type": "PADDING" }),
        WriteFrame::RstStream(rst) => json!({
            "frame_type": "RST_STREAM",
            "stream_id": rst.stream_id,
            "error_code": rst.error_code,
            "offset": rst.offset,
        }),
        WriteFrame::ConnectionClose(close) => json!({
            "frame_type": "CONNECTION_CLOSE",
            "error": close.error_code.to_string(),
            "reason": close.reason_phrase,
            "closing_frame_type": close.closing_frame_type.as_str(),
        }),
        WriteFrame::MaxData(max_data) => json!({
            "frame_type": "MAX_DATA",
            "maximum": max_data.maximum_data,
        }),
        WriteFrame::MaxStreamData(max_stream_data) => json!({
            "frame_type": "MAX_STREAM_DATA",
            "id": max_stream_data.stream_id,
            "maximum": max_stream_data.maximum_data,
        }),
        WriteFrame::DataBlocked(blocked) => json!({
            "frame_type": "DATA_BLOCKED",
            "data_limit": blocked.data_limit,
        }),
        WriteFrame::StreamDataBlocked(blocked) => json!({
            "frame_type": "STREAM_DATA_BLOCKED",
            "id": blocked.stream_id,
            "data_limit": blocked.data_limit,
        }),
        WriteFrame::StreamsBlocked(blocked) => json!({
            "frame_type": if blocked.is_for_bidirectional {
                "STREAMS_BLOCKED_BIDI"
            } else {
                "STREAMS_BLOCKED_UNI"
            },
            "stream_limit": blocked.stream_limit,
        }),
        WriteFrame::Ack(ack) => json!({
            "frame_type": "ACK",
            "ack_delay": ack.ack_delay.as_micros() as u64,
            "acked_ranges": ack
                .ack_blocks
                .iter()
                .map(|b| json!([b.start, b.end]))
                .collect::<Vec<_>>(),
        }),
        WriteFrame::Stream(stream) => json!({
            "frame_type": "STREAM",
            "id": stream.stream_id,
            "offset": stream.offset,
            "length": stream.len,
            "fin": stream.fin,
        }),
        WriteFrame::Crypto(crypto) => json!({
            "frame_type": "CRYPTO_FRAME",
            "offset": crypto.offset,
            "len": crypto.len,
        }),
        WriteFrame::Simple(simple) => simple_frame_to_json(simple),
    }
}

fn simple_frame_to_json(frame: &SimpleFrame) -> Value {
    match frame {
        SimpleFrame::Ping(_) => json!({ "frame_type": "PING" }),
        SimpleFrame::StopSending(stop) => json!({
            "frame_type": "STOP_SENDING",
            "stream_id": stop.stream_id,
            "error_code": stop.error_code,
        }),
        SimpleFrame::MinStreamData(min) => json!({
            "frame_type": "MIN_STREAM_DATA",
            "stream_id": min.stream_id,
            "maximum_data": min.maximum_data,
            "minimum_stream_offset": min.minimum_stream_offset,
        }),
        SimpleFrame::ExpiredStreamData(expired) => json!({
            "frame_type": "EXPIRED_STREAM_DATA",
            "stream_id": expired.stream_id,
            "minimum_stream_offset": expired.minimum_stream_offset,
        }),
        SimpleFrame::PathChallenge(challenge) => json!({
            "frame_type": "PATH_CHALLENGE",
            "path_data": challenge.path_data,
        }),
        SimpleFrame::PathResponse(response) => json!({
            "frame_type": "PATH_RESPONSE",
            "path_data": response.path_data,
        }),
        SimpleFrame::NewConnectionId(ncid) => json!({
            "frame_type": "NEW_CONNECTION_ID",
            "sequence": ncid.sequence_number,
            "retire_prior_to": ncid.retire_prior_to,
            "connection_id": ncid.connection_id.hex(),
        }),
        SimpleFrame::MaxStreams(max_streams) => json!({
            "frame_type": if max_streams.is_for_bidirectional {
                "MAX_STREAMS_BIDI"
            } else {
                "MAX_STREAMS_UNI"
            },
            "max_streams": max_streams.max_streams,
        }),
        SimpleFrame::RetireConnectionId(retire) => json!({
            "frame_type": "RETIRE_CONNECTION_ID",
            "sequence": retire.sequence_number,
        }),
    }
}

fn header_to_json(header: &PacketHeader, packet_size: u64) -> Value {
    json!({
        "packet_size": packet_size,
        "packet_number": header.packet_sequence_num(),
        "packet_type": match header {
            PacketHeader::Long(long) => long.header_type().as_str(),
            PacketHeader::Short(_) => "1RTT",
        },
    })
}

/// The transport's event sink. One instance per connection; the reference
/// time base is injected at construction, never global.
pub trait QLogger {
    fn add_packet_sent(&mut self, packet: &RegularWritePacket, packet_size: u64);
    fn add_packet_received(&mut self, packet: &RegularPacket, packet_size: u64);
    fn add_connection_close(
        &mut self,
        error: String,
        reason: String,
        drain_connection: bool,
        send_close_immediately: bool,
    );
    #[allow(clippy::too_many_arguments)]
    fn add_transport_summary(
        &mut self,
        total_bytes_sent: u64,
        total_bytes_recvd: u64,
        sum_cur_write_offset: u64,
        sum_max_observed_offset: u64,
        sum_cur_stream_buffer_len: u64,
        total_bytes_retransmitted: u64,
        total_stream_bytes_cloned: u64,
        total_bytes_cloned: u64,
        total_crypto_data_written: u64,
        total_crypto_data_recvd: u64,
    );
    fn add_congestion_metric_update(
        &mut self,
        bytes_in_flight: u64,
        current_cwnd: u64,
        congestion_event: &str,
        state: &str,
        recovery_state: &str,
    );
    fn add_pacing_metric_update(&mut self, pacing_burst_size: u64, pacing_interval: Duration);
    fn add_pacing_observation(&mut self, actual: &str, expected: &str, conclusion: &str);
    fn add_bandwidth_est_update(&mut self, bytes: u64, interval: Duration);
    fn add_app_limited_update(&mut self);
    fn add_app_unlimited_update(&mut self);
    fn add_app_idle_update(&mut self, idle_event: &str, idle: bool);
    fn add_packet_drop(&mut self, packet_size: u64, drop_reason: &str);
    fn add_datagram_received(&mut self, data_len: u64);
    fn add_loss_alarm(
        &mut self,
        largest_sent: PacketNum,
        alarm_count: u64,
        outstanding_packets: u64,
        alarm_type: &str,
    );
    fn add_packets_lost(
        &mut self,
        largest_lost_packet_num: PacketNum,
        lost_bytes: u64,
        lost_packets: u64,
    );
    fn add_transport_state_update(&mut self, update: &str);
    fn add_packet_buffered(
        &mut self,
        packet_num: PacketNum,
        protection_type: ProtectionType,
        packet_size: u64,
    );
    fn add_packet_ack(&mut self, packet_num_space: &str, packet_num: PacketNum);
    fn add_metric_update(
        &mut self,
        latest_rtt: Duration,
        mrtt: Duration,
        srtt: Duration,
        ack_delay: Duration,
    );
    fn add_stream_state_update(
        &mut self,
        id: StreamId,
        update: &str,
        time_since_stream_creation: Option<Duration>,
    );
    fn add_connection_migration_update(&mut self, intentional_migration: bool);
    fn add_path_validation_event(&mut self, success: bool);
}

/// Accumulates events in memory and renders the qlog JSON document.
pub struct FileQLogger {
    pub vantage_point: VantagePoint,
    pub protocol_type: String,
    reference_time: Instant,
    pub events: Vec<QLogEvent>,
}

impl FileQLogger {
    pub fn new(vantage_point: VantagePoint, protocol_type: String, reference_time: Instant) -> Self {
        Self {
            vantage_point,
            protocol_type,
            reference_time,
            events: Vec::new(),
        }
    }

    fn push(&mut self, category: QLogCategory, event_type: QLogEventType, data: Value) {
        let reference_time_us = self.reference_time.elapsed().as_micros() as u64;
        self.events.push(QLogEvent {
            reference_time_us,
            category,
            event_type,
            trigger: DEFAULT_TRIGGER.to_string(),
            data,
        });
    }

    /// The complete qlog document for all events so far.
    pub fn to_json(&self) -> Value {
        json!({
            "qlog_version": QLOG_VERSION,
            "traces": [{
                "vantage_point": {
                    "type": match self.vantage_point {
                        VantagePoint::Client => "CLIENT",
                        VantagePoint::Server => "SERVER",
                    },
                },
                "protocol_type": self.protocol_type,
                "event_fields": [
                    "relative_time",
                    "CATEGORY",
                    "EVENT_TYPE",
                    "TRIGGER",
                    "DATA",
                ],
                "events": self.events.iter().map(QLogEvent::to_json).collect::<Vec<_>>(),
            }],
        })
    }
}

impl QLogger for FileQLogger {
    fn add_packet_sent(&mut self, packet: &RegularWritePacket, packet_size: u64) {
        let mut data = header_to_json(&packet.header, packet_size);
        data["frames"] = Value::Array(packet.frames.iter().map(write_frame_to_json).collect());
        self.push(QLogCategory::Transport, QLogEventType::PacketSent, data);
    }

    fn add_packet_received(&mut self, packet: &RegularPacket, packet_size: u64) {
        let data = header_to_json(&packet.header, packet_size);
        self.push(QLogCategory::Transport, QLogEventType::PacketReceived, data);
    }

    fn add_connection_close(
        &mut self,
        error: String,
        reason: String,
        drain_connection: bool,
        send_close_immediately: bool,
    ) {
        self.push(
            QLogCategory::Connectivity,
            QLogEventType::ConnectionClose,
            json!({
                "error": error,
                "reason": reason,
                "drain_connection": drain_connection,
                "send_close_immediately": send_close_immediately,
            }),
        );
    }

    fn add_transport_summary(
        &mut self,
        total_bytes_sent: u64,
        total_bytes_recvd: u64,
        sum_cur_write_offset: u64,
        sum_max_observed_offset: u64,
        sum_cur_stream_buffer_len: u64,
        total_bytes_retransmitted: u64,
        total_stream_bytes_cloned: u64,
        total_bytes_cloned: u64,
        total_crypto_data_written: u64,
        total_crypto_data_recvd: u64,
    ) {
        self.push(
            QLogCategory::Transport,
            QLogEventType::TransportSummary,
            json!({
                "total_bytes_sent": total_bytes_sent,
                "total_bytes_recvd": total_bytes_recvd,
                "sum_cur_write_offset": sum_cur_write_offset,
                "sum_max_observed_offset": sum_max_observed_offset,
                "sum_cur_stream_buffer_len": sum_cur_stream_buffer_len,
                "total_bytes_retransmitted": total_bytes_retransmitted,
                "total_stream_bytes_cloned": total_stream_bytes_cloned,
                "total_bytes_cloned": total_bytes_cloned,
                "total_crypto_data_written": total_crypto_data_written,
                "total_crypto_data_recvd": total_crypto_data_recvd,
            }),
        );
    }

    fn add_congestion_metric_update(
        &mut self,
        bytes_in_flight: u64,
        current_cwnd: u64,
        congestion_event: &str,
        state: &str,
        recovery_state: &str,
    ) {
        self.push(
            QLogCategory::MetricUpdate,
            QLogEventType::CongestionMetricUpdate,
            json!({
                "bytes_in_flight": bytes_in_flight,
                "current_cwnd": current_cwnd,
                "congestion_event": congestion_event,
                "state": state,
                "recovery_state": recovery_state,
            }),
        );
    }

    fn add_pacing_metric_update(&mut self, pacing_burst_size: u64, pacing_interval: Duration) {
        self.push(
            QLogCategory::MetricUpdate,
            QLogEventType::PacingMetricUpdate,
            json!({
                "pacing_burst_size": pacing_burst_size,
                "pacing_interval": pacing_interval.as_micros() as u64,
            }),
        );
    }

    fn add_pacing_observation(&mut self, actual: &str, expected: &str, conclusion: &str) {
        self.push(
            QLogCategory::MetricUpdate,
            QLogEventType::PacingObservation,
            json!({
                "actual_pacing_rate": actual,
                "expected_pacing_rate": expected,
                "conclusion": conclusion,
            }),
        );
    }

    fn add_bandwidth_est_update(&mut self, bytes: u64, interval: Duration) {
        self.push(
            QLogCategory::BandwidthEstUpdate,
            QLogEventType::BandwidthEstUpdate,
            json!({
                "bandwidth_bytes": bytes,
                "bandwidth_interval": interval.as_micros() as u64,
            }),
        );
    }

    fn add_app_limited_update(&mut self) {
        self.push(
            QLogCategory::AppLimitedUpdate,
            QLogEventType::AppLimitedUpdate,
            json!({ "app_limited": true }),
        );
    }

    fn add_app_unlimited_update(&mut self) {
        self.push(
            QLogCategory::AppLimitedUpdate,
            QLogEventType::AppLimitedUpdate,
            json!({ "app_limited": false }),
        );
    }

    fn add_app_idle_update(&mut self, idle_event: &str, idle: bool) {
        self.push(
            QLogCategory::IdleUpdate,
            QLogEventType::AppIdleUpdate,
            json!({
                "idle_event": idle_event,
                "idle": idle,
            }),
        );
    }

    fn add_packet_drop(&mut self, packet_size: u64, drop_reason: &str) {
        self.push(
            QLogCategory::Loss,
            QLogEventType::PacketDrop,
            json!({
                "packet_size": packet_size,
                "drop_reason": drop_reason,
            }),
        );
    }

    fn add_datagram_received(&mut self, data_len: u64) {
        self.push(
            QLogCategory::Transport,
            QLogEventType::DatagramReceived,
            json!({ "data_len": data_len }),
        );
    }

    fn add_loss_alarm(
        &mut self,
        largest_sent: PacketNum,
        alarm_count: u64,
        outstanding_packets: u64,
        alarm_type: &str,
    ) {
        self.push(
            QLogCategory::Loss,
            QLogEventType::LossAlarm,
            json!({
                "largest_sent": largest_sent,
                "alarm_count": alarm_count,
                "outstanding_packets": outstanding_packets,
                "type": alarm_type,
            }),
        );
    }

    fn add_packets_lost(
        &mut self,
        largest_lost_packet_num: PacketNum,
        lost_bytes: u64,
        lost_packets: u64,
    ) {
        self.push(
            QLogCategory::Loss,
            QLogEventType::PacketsLost,
            json!({
                "largest_lost_packet_num": largest_lost_packet_num,
                "lost_bytes": lost_bytes,
                "lost_packets": lost_packets,
            }),
        );
    }

    fn add_transport_state_update(&mut self, update: &str) {
        self.push(
            QLogCategory::Transport,
            QLogEventType::TransportStateUpdate,
            json!({ "update": update }),
        );
    }

    fn add_packet_buffered(
        &mut self,
        packet_num: PacketNum,
        protection_type: ProtectionType,
        packet_size: u64,
    ) {
        self.push(
            QLogCategory::Transport,
            QLogEventType::PacketBuffered,
            json!({
                "packet_num": packet_num,
                "protection_type": protection_type.as_str(),
                "packet_size": packet_size,
            }),
        );
    }

    fn add_packet_ack(&mut self, packet_num_space: &str, packet_num: PacketNum) {
        self.push(
            QLogCategory::Transport,
            QLogEventType::PacketAck,
            json!({
                "packet_num_space": packet_num_space,
                "packet_num": packet_num,
            }),
        );
    }

    fn add_metric_update(
        &mut self,
        latest_rtt: Duration,
        mrtt: Duration,
        srtt: Duration,
        ack_delay: Duration,
    ) {
        self.push(
            QLogCategory::MetricUpdate,
            QLogEventType::MetricUpdate,
            json!({
                "latest_rtt": latest_rtt.as_micros() as u64,
                "min_rtt": mrtt.as_micros() as u64,
                "smoothed_rtt": srtt.as_micros() as u64,
                "ack_delay": ack_delay.as_micros() as u64,
            }),
        );
    }

    fn add_stream_state_update(
        &mut self,
        id: StreamId,
        update: &str,
        time_since_stream_creation: Option<Duration>,
    ) {
        let mut data = json!({
            "id": id,
            "update": update,
        });
        if let Some(elapsed) = time_since_stream_creation {
            data["ms_since_creation"] = json!(elapsed.as_millis() as u64);
        }
        self.push(QLogCategory::Http3, QLogEventType::StreamStateUpdate, data);
    }

    fn add_connection_migration_update(&mut self, intentional_migration: bool) {
        self.push(
            QLogCategory::Connectivity,
            QLogEventType::ConnectionMigration,
            json!({ "intentional": intentional_migration }),
        );
    }

    fn add_path_validation_event(&mut self, success: bool) {
        self.push(
            QLogCategory::Connectivity,
            QLogEventType::PathValidation,
            json!({ "success": success }),
        );
    }
}
