//! Connection state, the stream manager, the simple-frame processor and the
//! unvalidated-path rate limiter.

pub mod rate_limiter;
pub mod simple_frames;
pub mod state;
pub mod streams;

pub use rate_limiter::PendingPathRateLimiter;
pub use simple_frames::{
    send_simple_frame, update_simple_frame_on_ack, update_simple_frame_on_packet_clone,
    update_simple_frame_on_packet_loss, update_simple_frame_on_packet_received,
    update_simple_frame_on_packet_sent,
};
pub use state::{
    update_rtt, AckState, AckStates, ConnectionFlowControlState, CryptoState, CryptoStream,
    OutstandingPacket, PacketEvent, PendingEvents, QuicConnectionState, RttState,
};
pub use streams::{
    advance_current_receive_offset, advance_minimum_retransmittable_offset,
    stream_frame_matches_retransmit_buffer, StreamBuffer, StreamFlowControlState, StreamManager,
    StreamSendState, StreamState,
};
