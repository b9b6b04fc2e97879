//! Frame families, parsing and serialization.

pub mod parse;
pub mod types;
pub mod write;

pub use parse::{parse_frame, parse_frames, CodecParameters};
pub use types::{
    AckBlock, AckBlocks, ConnectionCloseFrame, DataBlockedFrame, ExpiredStreamDataFrame,
    FrameType, MaxDataFrame, MaxStreamDataFrame, MaxStreamsFrame, MinStreamDataFrame,
    NewConnectionIdFrame, PaddingFrame, PathChallengeFrame, PathResponseFrame, PingFrame,
    ReadAckFrame, ReadCryptoFrame, ReadFrame, ReadNewTokenFrame, ReadStreamFrame,
    RetireConnectionIdFrame, RstStreamFrame, SimpleFrame, StopSendingFrame,
    StreamDataBlockedFrame, StreamTypeField, StreamsBlockedFrame, WriteAckFrame, WriteCryptoFrame,
    WriteFrame, WriteStreamFrame,
};
pub use write::{
    generate_max_data_frame, write_ack_frame, write_crypto_frame, write_frame,
    write_simple_frame, write_stream_frame_data, write_stream_frame_header, AckFrameMetaData,
    AckFrameWriteResult,
};
