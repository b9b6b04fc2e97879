//! Observational counters for the transport.
//!
//! One callback instance is expected per worker thread; aggregation happens
//! at the application layer. Every method is called on hot paths, so
//! implementations must never block. All hooks are best-effort; no transport
//! decision depends on them.

/// Why an inbound packet was discarded without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDropReason {
    None,
    ConnectionNotFound,
    DecryptionError,
    InvalidPacket,
    ParseError,
    PeerAddressChange,
    ProtocolViolation,
    RoutingErrorWrongHost,
    ServerStateClosed,
    TransportParameterError,
    WorkerNotInitialized,
    ServerShutdown,
    InitialConnIdSmall,
}

impl PacketDropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketDropReason::None => "NONE",
            PacketDropReason::ConnectionNotFound => "CONNECTION_NOT_FOUND",
            PacketDropReason::DecryptionError => "DECRYPTION_ERROR",
            PacketDropReason::InvalidPacket => "INVALID_PACKET",
            PacketDropReason::ParseError => "PARSE_ERROR",
            PacketDropReason::PeerAddressChange => "PEER_ADDRESS_CHANGE",
            PacketDropReason::ProtocolViolation => "PROTOCOL_VIOLATION",
            PacketDropReason::RoutingErrorWrongHost => "ROUTING_ERROR_WRONG_HOST",
            PacketDropReason::ServerStateClosed => "SERVER_STATE_CLOSED",
            PacketDropReason::TransportParameterError => "TRANSPORT_PARAMETER_ERROR",
            PacketDropReason::WorkerNotInitialized => "WORKER_NOT_INITIALIZED",
            PacketDropReason::ServerShutdown => "SERVER_SHUTDOWN",
            PacketDropReason::InitialConnIdSmall => "INITIAL_CONNID_SMALL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseReason {
    None,
    ConnError,
    IdleTimeout,
}

impl ConnectionCloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionCloseReason::None => "NONE",
            ConnectionCloseReason::ConnError => "CONN_ERROR",
            ConnectionCloseReason::IdleTimeout => "IDLE_TIMEOUT",
        }
    }
}

/// Classified socket write errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorType {
    Again,
    Inval,
    MsgSize,
    NoBufs,
    NoMem,
    Other,
}

impl SocketErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketErrorType::Again => "AGAIN",
            SocketErrorType::Inval => "INVAL",
            SocketErrorType::MsgSize => "MSGSIZE",
            SocketErrorType::NoBufs => "NOBUFS",
            SocketErrorType::NoMem => "NOMEM",
            SocketErrorType::Other => "Other",
        }
    }

    pub fn from_errno(err: i32) -> Self {
        match err {
            libc::EAGAIN => SocketErrorType::Again,
            libc::EINVAL => SocketErrorType::Inval,
            libc::EMSGSIZE => SocketErrorType::MsgSize,
            libc::ENOBUFS => SocketErrorType::NoBufs,
            libc::ENOMEM => SocketErrorType::NoMem,
            _ => SocketErrorType::Other,
        }
    }
}

/// Transport-level stats sink. Default bodies are no-ops so implementations
/// override only what they record.
pub trait TransportStatsCallback {
    // packet level metrics
    fn on_packet_received(&mut self) {}
    fn on_duplicated_packet_received(&mut self) {}
    fn on_out_of_order_packet_received(&mut self) {}
    fn on_packet_processed(&mut self) {}
    fn on_packet_sent(&mut self) {}
    fn on_packet_retransmission(&mut self) {}
    fn on_packet_dropped(&mut self, _reason: PacketDropReason) {}
    fn on_packet_forwarded(&mut self) {}
    fn on_forwarded_packet_received(&mut self) {}
    fn on_forwarded_packet_processed(&mut self) {}

    // connection level metrics
    fn on_new_connection(&mut self) {}
    fn on_connection_close(&mut self, _reason: Option<ConnectionCloseReason>) {}

    // stream level metrics
    fn on_new_quic_stream(&mut self) {}
    fn on_quic_stream_closed(&mut self) {}
    fn on_quic_stream_reset(&mut self) {}

    // flow control / congestion control / loss recovery
    fn on_conn_flow_control_update(&mut self) {}
    fn on_conn_flow_control_blocked(&mut self) {}
    fn on_stateless_reset(&mut self) {}
    fn on_stream_flow_control_update(&mut self) {}
    fn on_stream_flow_control_blocked(&mut self) {}
    fn on_cwnd_blocked(&mut self) {}
    fn on_pto(&mut self) {}

    // bytes on the wire
    fn on_read(&mut self, _buf_size: usize) {}
    fn on_write(&mut self, _buf_size: usize) {}
    fn on_udp_socket_write_error(&mut self, _error_type: SocketErrorType) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            SocketErrorType::from_errno(libc::EAGAIN),
            SocketErrorType::Again
        );
        assert_eq!(
            SocketErrorType::from_errno(libc::EMSGSIZE),
            SocketErrorType::MsgSize
        );
        assert_eq!(SocketErrorType::from_errno(9999), SocketErrorType::Other);
    }
}
