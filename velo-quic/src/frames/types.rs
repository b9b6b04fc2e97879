//! # Frame model (RFC 9000 Section 19)
//!
//! Three in-memory families share the wire format:
//!
//! - [`ReadFrame`] — parser output; variants own their payload buffers.
//! - [`WriteFrame`] — builder output; variants carry only sizes and offsets,
//!   payload bytes stay in the stream retransmission buffers.
//! - [`SimpleFrame`] — the subset whose lifecycle is managed by the shared
//!   processor in `connection::simple_frames`.

use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

use crate::error::{ApplicationErrorCode, QuicErrorCode};
use crate::types::{ConnectionId, PacketNum, StatelessResetToken, StreamId};

/// Wire frame-type codes. STREAM occupies 0x08..=0x0f with flag bits; the
/// partial-reliability pair sits in the experimental range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Ack = 0x02,
    AckEcn = 0x03,
    RstStream = 0x04,
    StopSending = 0x05,
    Crypto = 0x06,
    NewToken = 0x07,
    Stream = 0x08,
    MaxData = 0x10,
    MaxStreamData = 0x11,
    MaxStreamsBidi = 0x12,
    MaxStreamsUni = 0x13,
    DataBlocked = 0x14,
    StreamDataBlocked = 0x15,
    StreamsBlockedBidi = 0x16,
    StreamsBlockedUni = 0x17,
    NewConnectionId = 0x18,
    RetireConnectionId = 0x19,
    PathChallenge = 0x1a,
    PathResponse = 0x1b,
    ConnectionClose = 0x1c,
    ConnectionCloseAppErr = 0x1d,
    MinStreamData = 0xfe,
    ExpiredStreamData = 0xff,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Padding => "PADDING",
            FrameType::Ping => "PING",
            FrameType::Ack => "ACK",
            FrameType::AckEcn => "ACK_ECN",
            FrameType::RstStream => "RST_STREAM",
            FrameType::StopSending => "STOP_SENDING",
            FrameType::Crypto => "CRYPTO_FRAME",
            FrameType::NewToken => "NEW_TOKEN",
            FrameType::Stream => "STREAM",
            FrameType::MaxData => "MAX_DATA",
            FrameType::MaxStreamData => "MAX_STREAM_DATA",
            FrameType::MaxStreamsBidi => "MAX_STREAMS_BIDI",
            FrameType::MaxStreamsUni => "MAX_STREAMS_UNI",
            FrameType::DataBlocked => "DATA_BLOCKED",
            FrameType::StreamDataBlocked => "STREAM_DATA_BLOCKED",
            FrameType::StreamsBlockedBidi => "STREAMS_BLOCKED_BIDI",
            FrameType::StreamsBlockedUni => "STREAMS_BLOCKED_UNI",
            FrameType::NewConnectionId => "NEW_CONNECTION_ID",
            FrameType::RetireConnectionId => "RETIRE_CONNECTION_ID",
            FrameType::PathChallenge => "PATH_CHALLENGE",
            FrameType::PathResponse => "PATH_RESPONSE",
            FrameType::ConnectionClose => "CONNECTION_CLOSE",
            FrameType::ConnectionCloseAppErr => "CONNECTION_CLOSE_APP_ERR",
            FrameType::MinStreamData => "MIN_STREAM_DATA",
            FrameType::ExpiredStreamData => "EXPIRED_STREAM_DATA",
        }
    }
}

/// STREAM frame flag bits carried in the type byte.
pub const STREAM_FRAME_BIT_FIN: u8 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u8 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u8 = 0x04;

/// Builds the STREAM type byte from its flag bits.
#[derive(Debug, Clone, Copy)]
pub struct StreamTypeField(u8);

impl StreamTypeField {
    pub fn builder() -> StreamTypeFieldBuilder {
        StreamTypeFieldBuilder(FrameType::Stream as u8)
    }

    pub fn new(field: u8) -> Self {
        Self(field)
    }

    pub fn has_fin(&self) -> bool {
        self.0 & STREAM_FRAME_BIT_FIN != 0
    }

    pub fn has_data_length(&self) -> bool {
        self.0 & STREAM_FRAME_BIT_LEN != 0
    }

    pub fn has_offset(&self) -> bool {
        self.0 & STREAM_FRAME_BIT_OFF != 0
    }

    pub fn field_value(&self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamTypeFieldBuilder(u8);

impl StreamTypeFieldBuilder {
    pub fn set_fin(mut self) -> Self {
        self.0 |= STREAM_FRAME_BIT_FIN;
        self
    }

    pub fn set_offset(mut self) -> Self {
        self.0 |= STREAM_FRAME_BIT_OFF;
        self
    }

    pub fn set_length(mut self) -> Self {
        self.0 |= STREAM_FRAME_BIT_LEN;
        self
    }

    pub fn build(self) -> StreamTypeField {
        StreamTypeField(self.0)
    }
}

// ============================================================================
// Frame structs
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaddingFrame;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingFrame;

/// A contiguous run of acknowledged packet numbers, `[start, end]` inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    pub start: PacketNum,
    pub end: PacketNum,
}

impl AckBlock {
    pub fn new(start: PacketNum, end: PacketNum) -> Self {
        Self { start, end }
    }
}

/// Sorted, non-overlapping, non-adjacent set of acknowledged packet ranges,
/// ascending by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckBlocks(Vec<AckBlock>);

impl AckBlocks {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts `[start, end]`, merging with overlapping or adjacent runs.
    pub fn insert(&mut self, start: PacketNum, end: PacketNum) {
        debug_assert!(start <= end);
        let mut merged = AckBlock::new(start, end);
        let mut out = Vec::with_capacity(self.0.len() + 1);
        let mut placed = false;
        for block in self.0.drain(..) {
            if block.end + 1 < merged.start {
                out.push(block);
            } else if merged.end + 1 < block.start {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(block);
            } else {
                merged.start = merged.start.min(block.start);
                merged.end = merged.end.max(block.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.0 = out;
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn largest_acked(&self) -> Option<PacketNum> {
        self.0.last().map(|b| b.end)
    }

    pub fn as_slice(&self) -> &[AckBlock] {
        &self.0
    }
}

/// ACK frame as parsed off the wire. Blocks are ordered descending by start
/// packet, largest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAckFrame {
    pub largest_acked: PacketNum,
    pub ack_delay: Duration,
    pub ack_blocks: TinyVec<[AckBlock; 8]>,
}

/// ACK frame as written; blocks in reverse order (largest first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteAckFrame {
    pub ack_blocks: Vec<AckBlock>,
    /// Delay between receiving the largest acked packet and sending the ack.
    pub ack_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ApplicationErrorCode,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: ApplicationErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCryptoFrame {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNewTokenFrame {
    pub token: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub len: u64,
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
}

/// Informs the sender of the maximum stream data (like MAX_STREAM_DATA) and
/// requests an update to the minimum retransmittable offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
    pub minimum_stream_offset: u64,
}

/// Informs the receiver of the minimum retransmittable offset for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredStreamDataFrame {
    pub stream_id: StreamId,
    pub minimum_stream_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    /// Cumulative count of streams of this directionality.
    pub max_streams: u64,
    pub is_for_bidirectional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub stream_limit: u64,
    pub is_for_bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: ConnectionId,
    pub token: StatelessResetToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChallengeFrame {
    pub path_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResponseFrame {
    pub path_data: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: QuicErrorCode,
    pub reason_phrase: String,
    /// The frame type that triggered the close; PADDING when unknown.
    pub closing_frame_type: FrameType,
}

impl ConnectionCloseFrame {
    pub fn new(error_code: QuicErrorCode, reason_phrase: String) -> Self {
        Self {
            error_code,
            reason_phrase,
            closing_frame_type: FrameType::Padding,
        }
    }
}

// ============================================================================
// Frame families
// ============================================================================

/// Frames whose send / ack / loss / clone / receive lifecycle is handled by
/// the shared simple-frame processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleFrame {
    Ping(PingFrame),
    StopSending(StopSendingFrame),
    MinStreamData(MinStreamDataFrame),
    ExpiredStreamData(ExpiredStreamDataFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    NewConnectionId(NewConnectionIdFrame),
    MaxStreams(MaxStreamsFrame),
    RetireConnectionId(RetireConnectionIdFrame),
}

/// Frames produced by the parser; payload buffers are owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrame {
    Padding(PaddingFrame),
    RstStream(RstStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    Ack(ReadAckFrame),
    Stream(ReadStreamFrame),
    Crypto(ReadCryptoFrame),
    NewToken(ReadNewTokenFrame),
    Simple(SimpleFrame),
}

/// Frames recorded by the packet builder; only sizes and offsets, the bytes
/// live in retransmission buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFrame {
    Padding(PaddingFrame),
    RstStream(RstStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    Ack(WriteAckFrame),
    Stream(WriteStreamFrame),
    Crypto(WriteCryptoFrame),
    Simple(SimpleFrame),
}

impl WriteFrame {
    /// Whether loss of this frame obligates a retransmission.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, WriteFrame::Padding(_) | WriteFrame::Ack(_))
    }
}
