//! Frame parsing from decrypted packet payloads.
//!
//! Strict pull on [`bytes::Buf`]: truncated or malformed input raises
//! `FRAME_ENCODING_ERROR`. Payload-carrying frames copy into owned `Bytes`.

use bytes::{Buf, Bytes};
use core::time::Duration;
use tinyvec::TinyVec;

use crate::error::{QuicError, QuicErrorCode, QuicResult, TransportErrorCode};
use crate::frames::types::{
    AckBlock, ConnectionCloseFrame, DataBlockedFrame, ExpiredStreamDataFrame, FrameType,
    MaxDataFrame, MaxStreamDataFrame, MaxStreamsFrame, MinStreamDataFrame, NewConnectionIdFrame,
    PaddingFrame, PathChallengeFrame, PathResponseFrame, PingFrame, ReadAckFrame, ReadCryptoFrame,
    ReadFrame, ReadNewTokenFrame, ReadStreamFrame, RetireConnectionIdFrame, RstStreamFrame,
    SimpleFrame, StopSendingFrame, StreamDataBlockedFrame, StreamTypeField, StreamsBlockedFrame,
    WriteStreamFrame,
};
use crate::types::{
    decode_quic_integer, ConnectionId, QuicVersion, StatelessResetToken, StreamId,
    DEFAULT_ACK_DELAY_EXPONENT, MAX_CONNECTION_ID_SIZE, STATELESS_RESET_TOKEN_LENGTH,
};

/// Knobs the parser needs from the negotiated transport state.
#[derive(Debug, Clone, Copy)]
pub struct CodecParameters {
    pub ack_delay_exponent: u64,
    pub version: QuicVersion,
}

impl Default for CodecParameters {
    fn default() -> Self {
        Self {
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            version: QuicVersion::QUIC_V1,
        }
    }
}

fn encoding_error(reason: &'static str) -> QuicError {
    QuicError::transport(TransportErrorCode::FrameEncodingError, reason)
}

fn pull_integer<B: Buf>(buf: &mut B) -> QuicResult<u64> {
    decode_quic_integer(buf)
        .map(|(value, _)| value)
        .ok_or_else(|| encoding_error("truncated QUIC integer"))
}

fn pull_bytes<B: Buf>(buf: &mut B, len: usize) -> QuicResult<Bytes> {
    if buf.remaining() < len {
        return Err(encoding_error("truncated frame payload"));
    }
    Ok(buf.copy_to_bytes(len))
}

fn pull_u8<B: Buf>(buf: &mut B) -> QuicResult<u8> {
    if !buf.has_remaining() {
        return Err(encoding_error("truncated frame"));
    }
    Ok(buf.get_u8())
}

fn pull_u64<B: Buf>(buf: &mut B) -> QuicResult<u64> {
    if buf.remaining() < 8 {
        return Err(encoding_error("truncated frame"));
    }
    Ok(buf.get_u64())
}

/// Parses every frame of a decrypted payload, in wire order.
pub fn parse_frames<B: Buf>(buf: &mut B, params: &CodecParameters) -> QuicResult<Vec<ReadFrame>> {
    let mut frames = Vec::new();
    while buf.has_remaining() {
        frames.push(parse_frame(buf, params)?);
    }
    Ok(frames)
}

/// Parses a single frame off the front of `buf`.
pub fn parse_frame<B: Buf>(buf: &mut B, params: &CodecParameters) -> QuicResult<ReadFrame> {
    let frame_type = pull_integer(buf)?;
    match frame_type {
        0x00 => Ok(ReadFrame::Padding(PaddingFrame)),
        0x01 => Ok(ReadFrame::Simple(SimpleFrame::Ping(PingFrame))),
        0x02 | 0x03 => parse_ack_frame(buf, params, frame_type == 0x03),
        0x04 => parse_rst_stream_frame(buf, params),
        0x05 => parse_stop_sending_frame(buf, params),
        0x06 => parse_crypto_frame(buf),
        0x07 => parse_new_token_frame(buf),
        0x08..=0x0f => parse_stream_frame(buf, frame_type as u8),
        0x10 => Ok(ReadFrame::MaxData(MaxDataFrame {
            maximum_data: pull_integer(buf)?,
        })),
        0x11 => Ok(ReadFrame::MaxStreamData(MaxStreamDataFrame {
            stream_id: pull_integer(buf)?,
            maximum_data: pull_integer(buf)?,
        })),
        0x12 | 0x13 => Ok(ReadFrame::Simple(SimpleFrame::MaxStreams(MaxStreamsFrame {
            max_streams: pull_integer(buf)?,
            is_for_bidirectional: frame_type == 0x12,
        }))),
        0x14 => Ok(ReadFrame::DataBlocked(DataBlockedFrame {
            data_limit: pull_integer(buf)?,
        })),
        0x15 => Ok(ReadFrame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: pull_integer(buf)?,
            data_limit: pull_integer(buf)?,
        })),
        0x16 | 0x17 => Ok(ReadFrame::StreamsBlocked(StreamsBlockedFrame {
            stream_limit: pull_integer(buf)?,
            is_for_bidirectional: frame_type == 0x16,
        })),
        0x18 => parse_new_connection_id_frame(buf),
        0x19 => Ok(ReadFrame::Simple(SimpleFrame::RetireConnectionId(
            RetireConnectionIdFrame {
                sequence_number: pull_integer(buf)?,
            },
        ))),
        0x1a => Ok(ReadFrame::Simple(SimpleFrame::PathChallenge(
            PathChallengeFrame {
                path_data: pull_u64(buf)?,
            },
        ))),
        0x1b => Ok(ReadFrame::Simple(SimpleFrame::PathResponse(
            PathResponseFrame {
                path_data: pull_u64(buf)?,
            },
        ))),
        0x1c | 0x1d => parse_connection_close_frame(buf, params, frame_type == 0x1d),
        0xfe => Ok(ReadFrame::Simple(SimpleFrame::MinStreamData(
            MinStreamDataFrame {
                stream_id: pull_integer(buf)?,
                maximum_data: pull_integer(buf)?,
                minimum_stream_offset: pull_integer(buf)?,
            },
        ))),
        0xff => Ok(ReadFrame::Simple(SimpleFrame::ExpiredStreamData(
            ExpiredStreamDataFrame {
                stream_id: pull_integer(buf)?,
                minimum_stream_offset: pull_integer(buf)?,
            },
        ))),
        _ => Err(encoding_error("unknown frame type")),
    }
}

fn parse_ack_frame<B: Buf>(
    buf: &mut B,
    params: &CodecParameters,
    has_ecn: bool,
) -> QuicResult<ReadFrame> {
    let largest_acked = pull_integer(buf)?;
    let encoded_delay = pull_integer(buf)?;
    let ack_delay = Duration::from_micros(
        encoded_delay
            .checked_shl(params.ack_delay_exponent as u32)
            .ok_or_else(|| encoding_error("ack delay overflow"))?,
    );
    let additional_block_count = pull_integer(buf)?;
    let first_block_len = pull_integer(buf)?;

    let mut ack_blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
    let mut current_start = largest_acked
        .checked_sub(first_block_len)
        .ok_or_else(|| encoding_error("ack block underflow"))?;
    ack_blocks.push(AckBlock::new(current_start, largest_acked));

    for _ in 0..additional_block_count {
        let gap = pull_integer(buf)?;
        let block_len = pull_integer(buf)?;
        let end = current_start
            .checked_sub(gap + 2)
            .ok_or_else(|| encoding_error("ack gap underflow"))?;
        let start = end
            .checked_sub(block_len)
            .ok_or_else(|| encoding_error("ack block underflow"))?;
        ack_blocks.push(AckBlock::new(start, end));
        current_start = start;
    }

    if has_ecn {
        // ECN counts are parsed and dropped; congestion response to ECN is
        // the controller's concern.
        let _ect0 = pull_integer(buf)?;
        let _ect1 = pull_integer(buf)?;
        let _ce = pull_integer(buf)?;
    }

    Ok(ReadFrame::Ack(ReadAckFrame {
        largest_acked,
        ack_delay,
        ack_blocks,
    }))
}

fn parse_rst_stream_frame<B: Buf>(buf: &mut B, params: &CodecParameters) -> QuicResult<ReadFrame> {
    let stream_id = pull_integer(buf)?;
    let error_code = parse_error_code(buf, params)?;
    let offset = pull_integer(buf)?;
    Ok(ReadFrame::RstStream(RstStreamFrame {
        stream_id,
        error_code,
        offset,
    }))
}

fn parse_stop_sending_frame<B: Buf>(
    buf: &mut B,
    params: &CodecParameters,
) -> QuicResult<ReadFrame> {
    let stream_id = pull_integer(buf)?;
    let error_code = parse_error_code(buf, params)?;
    Ok(ReadFrame::Simple(SimpleFrame::StopSending(
        StopSendingFrame {
            stream_id,
            error_code,
        },
    )))
}

/// The legacy version carries error codes as fixed 16-bit fields.
fn parse_error_code<B: Buf>(buf: &mut B, params: &CodecParameters) -> QuicResult<u64> {
    if params.version.uses_packed_cid_lengths() {
        if buf.remaining() < 2 {
            return Err(encoding_error("truncated error code"));
        }
        Ok(u64::from(buf.get_u16()))
    } else {
        pull_integer(buf)
    }
}

fn parse_crypto_frame<B: Buf>(buf: &mut B) -> QuicResult<ReadFrame> {
    let offset = pull_integer(buf)?;
    let len = pull_integer(buf)?;
    let data = pull_bytes(buf, len as usize)?;
    Ok(ReadFrame::Crypto(ReadCryptoFrame { offset, data }))
}

fn parse_new_token_frame<B: Buf>(buf: &mut B) -> QuicResult<ReadFrame> {
    let len = pull_integer(buf)?;
    let token = pull_bytes(buf, len as usize)?;
    Ok(ReadFrame::NewToken(ReadNewTokenFrame { token }))
}

fn parse_stream_frame<B: Buf>(buf: &mut B, type_byte: u8) -> QuicResult<ReadFrame> {
    let field = StreamTypeField::new(type_byte);
    let stream_id: StreamId = pull_integer(buf)?;
    let offset = if field.has_offset() {
        pull_integer(buf)?
    } else {
        0
    };
    let data = if field.has_data_length() {
        let len = pull_integer(buf)?;
        pull_bytes(buf, len as usize)?
    } else {
        // No length: the frame consumes the rest of the packet.
        let rest = buf.remaining();
        pull_bytes(buf, rest)?
    };
    Ok(ReadFrame::Stream(ReadStreamFrame {
        stream_id,
        offset,
        data,
        fin: field.has_fin(),
    }))
}

fn parse_new_connection_id_frame<B: Buf>(buf: &mut B) -> QuicResult<ReadFrame> {
    let sequence_number = pull_integer(buf)?;
    let retire_prior_to = pull_integer(buf)?;
    let cid_len = usize::from(pull_u8(buf)?);
    if cid_len > MAX_CONNECTION_ID_SIZE {
        return Err(encoding_error("connection id too long"));
    }
    let connection_id = ConnectionId::from_buf(buf, cid_len)
        .map_err(|_| encoding_error("truncated connection id"))?;
    if buf.remaining() < STATELESS_RESET_TOKEN_LENGTH {
        return Err(encoding_error("truncated stateless reset token"));
    }
    let mut token: StatelessResetToken = [0u8; STATELESS_RESET_TOKEN_LENGTH];
    buf.copy_to_slice(&mut token);
    Ok(ReadFrame::Simple(SimpleFrame::NewConnectionId(
        NewConnectionIdFrame {
            sequence_number,
            retire_prior_to,
            connection_id,
            token,
        },
    )))
}

fn parse_connection_close_frame<B: Buf>(
    buf: &mut B,
    params: &CodecParameters,
    is_application: bool,
) -> QuicResult<ReadFrame> {
    let raw_code = if params.version.uses_packed_cid_lengths() {
        if buf.remaining() < 2 {
            return Err(encoding_error("truncated error code"));
        }
        u64::from(buf.get_u16())
    } else {
        pull_integer(buf)?
    };
    let closing_frame_type = if is_application {
        FrameType::Padding
    } else {
        frame_type_from_wire(pull_integer(buf)?)
    };
    let reason_len = pull_integer(buf)?;
    let reason = pull_bytes(buf, reason_len as usize)?;
    let reason_phrase = String::from_utf8(reason.to_vec())
        .map_err(|_| encoding_error("close reason is not utf-8"))?;
    let error_code = if is_application {
        QuicErrorCode::Application(raw_code)
    } else {
        QuicErrorCode::Transport(TransportErrorCode::from_wire(raw_code))
    };
    Ok(ReadFrame::ConnectionClose(ConnectionCloseFrame {
        error_code,
        reason_phrase,
        closing_frame_type,
    }))
}

/// Maps a wire type code back to a [`FrameType`]; unknown codes collapse to
/// PADDING, matching the "0 means unknown" convention of the close frame.
pub fn frame_type_from_wire(value: u64) -> FrameType {
    match value {
        0x00 => FrameType::Padding,
        0x01 => FrameType::Ping,
        0x02 => FrameType::Ack,
        0x03 => FrameType::AckEcn,
        0x04 => FrameType::RstStream,
        0x05 => FrameType::StopSending,
        0x06 => FrameType::Crypto,
        0x07 => FrameType::NewToken,
        0x08..=0x0f => FrameType::Stream,
        0x10 => FrameType::MaxData,
        0x11 => FrameType::MaxStreamData,
        0x12 => FrameType::MaxStreamsBidi,
        0x13 => FrameType::MaxStreamsUni,
        0x14 => FrameType::DataBlocked,
        0x15 => FrameType::StreamDataBlocked,
        0x16 => FrameType::StreamsBlockedBidi,
        0x17 => FrameType::StreamsBlockedUni,
        0x18 => FrameType::NewConnectionId,
        0x19 => FrameType::RetireConnectionId,
        0x1a => FrameType::PathChallenge,
        0x1b => FrameType::PathResponse,
        0x1c => FrameType::ConnectionClose,
        0x1d => FrameType::ConnectionCloseAppErr,
        0xfe => FrameType::MinStreamData,
        0xff => FrameType::ExpiredStreamData,
        _ => FrameType::Padding,
    }
}

/// Converts a parsed stream frame into its bookkeeping (write) form. Used by
/// tests and the rebuilder when reconciling echoes.
pub fn to_write_stream_frame(frame: &ReadStreamFrame) -> WriteStreamFrame {
    WriteStreamFrame {
        stream_id: frame.stream_id,
        offset: frame.offset,
        len: frame.data.len() as u64,
        fin: frame.fin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuicInteger;

    fn params() -> CodecParameters {
        CodecParameters::default()
    }

    #[test]
    fn parse_padding_and_ping() {
        let buf = [0x00u8, 0x01];
        let mut cursor = &buf[..];
        let frames = parse_frames(&mut cursor, &params()).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ReadFrame::Padding(_)));
        assert!(matches!(
            frames[1],
            ReadFrame::Simple(SimpleFrame::Ping(_))
        ));
    }

    #[test]
    fn parse_ack_frame_with_blocks() {
        let mut buf = Vec::new();
        QuicInteger::new(0x02).unwrap().encode(&mut buf); // type
        QuicInteger::new(100).unwrap().encode(&mut buf); // largest acked
        QuicInteger::new(10).unwrap().encode(&mut buf); // delay (<< 3 = 80us)
        QuicInteger::new(1).unwrap().encode(&mut buf); // additional blocks
        QuicInteger::new(5).unwrap().encode(&mut buf); // first block: 95..=100
        QuicInteger::new(3).unwrap().encode(&mut buf); // gap: next end = 90
        QuicInteger::new(2).unwrap().encode(&mut buf); // block len: 88..=90
        let mut cursor = &buf[..];
        let frame = parse_frame(&mut cursor, &params()).unwrap();
        let ReadFrame::Ack(ack) = frame else {
            panic!("expected ack");
        };
        assert_eq!(ack.largest_acked, 100);
        assert_eq!(ack.ack_delay, Duration::from_micros(80));
        assert_eq!(ack.ack_blocks.len(), 2);
        assert_eq!(ack.ack_blocks[0], AckBlock::new(95, 100));
        assert_eq!(ack.ack_blocks[1], AckBlock::new(88, 90));
    }

    #[test]
    fn parse_stream_frame_with_offset_and_len() {
        let mut buf = Vec::new();
        // OFF | LEN bits set
        buf.push(0x08 | STREAM_FRAME_BIT_OFF_TEST | STREAM_FRAME_BIT_LEN_TEST);
        QuicInteger::new(4).unwrap().encode(&mut buf); // stream id
        QuicInteger::new(100).unwrap().encode(&mut buf); // offset
        QuicInteger::new(3).unwrap().encode(&mut buf); // length
        buf.extend_from_slice(b"abc");
        let mut cursor = &buf[..];
        let frame = parse_frame(&mut cursor, &params()).unwrap();
        let ReadFrame::Stream(stream) = frame else {
            panic!("expected stream");
        };
        assert_eq!(stream.stream_id, 4);
        assert_eq!(stream.offset, 100);
        assert_eq!(&stream.data[..], b"abc");
        assert!(!stream.fin);
    }

    const STREAM_FRAME_BIT_OFF_TEST: u8 = 0x04;
    const STREAM_FRAME_BIT_LEN_TEST: u8 = 0x02;

    #[test]
    fn parse_stream_frame_without_len_consumes_rest() {
        let mut buf = Vec::new();
        buf.push(0x08 | STREAM_FRAME_BIT_FIN_TEST);
        QuicInteger::new(8).unwrap().encode(&mut buf);
        buf.extend_from_slice(b"tail-data");
        let mut cursor = &buf[..];
        let frame = parse_frame(&mut cursor, &params()).unwrap();
        let ReadFrame::Stream(stream) = frame else {
            panic!("expected stream");
        };
        assert_eq!(stream.offset, 0);
        assert_eq!(&stream.data[..], b"tail-data");
        assert!(stream.fin);
        assert!(!cursor.has_remaining());
    }

    const STREAM_FRAME_BIT_FIN_TEST: u8 = 0x01;

    #[test]
    fn parse_new_connection_id() {
        let mut buf = Vec::new();
        QuicInteger::new(0x18).unwrap().encode(&mut buf);
        QuicInteger::new(1).unwrap().encode(&mut buf); // sequence
        QuicInteger::new(0).unwrap().encode(&mut buf); // retire prior to
        buf.push(4);
        buf.extend_from_slice(&[9, 9, 9, 9]);
        buf.extend_from_slice(&[0xaa; 16]);
        let mut cursor = &buf[..];
        let frame = parse_frame(&mut cursor, &params()).unwrap();
        let ReadFrame::Simple(SimpleFrame::NewConnectionId(ncid)) = frame else {
            panic!("expected new connection id");
        };
        assert_eq!(ncid.sequence_number, 1);
        assert_eq!(ncid.retire_prior_to, 0);
        assert_eq!(ncid.connection_id.as_slice(), &[9, 9, 9, 9]);
        assert_eq!(ncid.token, [0xaa; 16]);
    }

    #[test]
    fn truncated_frame_is_encoding_error() {
        // CRYPTO frame claiming 10 bytes with only 2 present.
        let mut buf = Vec::new();
        QuicInteger::new(0x06).unwrap().encode(&mut buf);
        QuicInteger::new(0).unwrap().encode(&mut buf);
        QuicInteger::new(10).unwrap().encode(&mut buf);
        buf.extend_from_slice(&[1, 2]);
        let mut cursor = &buf[..];
        let err = parse_frame(&mut cursor, &params()).unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::FrameEncodingError)
        );
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let mut buf = Vec::new();
        QuicInteger::new(0x21).unwrap().encode(&mut buf);
        let mut cursor = &buf[..];
        assert!(parse_frame(&mut cursor, &params()).is_err());
    }

    #[test]
    fn parse_connection_close_transport() {
        let mut buf = Vec::new();
        QuicInteger::new(0x1c).unwrap().encode(&mut buf);
        QuicInteger::new(0x0a).unwrap().encode(&mut buf); // PROTOCOL_VIOLATION
        QuicInteger::new(0x08).unwrap().encode(&mut buf); // closing frame type
        QuicInteger::new(3).unwrap().encode(&mut buf);
        buf.extend_from_slice(b"bye");
        let mut cursor = &buf[..];
        let ReadFrame::ConnectionClose(close) = parse_frame(&mut cursor, &params()).unwrap()
        else {
            panic!("expected close");
        };
        assert_eq!(
            close.error_code,
            QuicErrorCode::Transport(TransportErrorCode::ProtocolViolation)
        );
        assert_eq!(close.closing_frame_type, FrameType::Stream);
        assert_eq!(close.reason_phrase, "bye");
    }

    #[test]
    fn legacy_version_uses_fixed_width_error_codes() {
        let legacy = CodecParameters {
            version: QuicVersion::MVFST_OLD,
            ..CodecParameters::default()
        };
        let mut buf = Vec::new();
        QuicInteger::new(0x05).unwrap().encode(&mut buf); // STOP_SENDING
        QuicInteger::new(4).unwrap().encode(&mut buf); // stream id
        buf.extend_from_slice(&0x4001u16.to_be_bytes()); // fixed 2-byte code
        let mut cursor = &buf[..];
        let ReadFrame::Simple(SimpleFrame::StopSending(stop)) =
            parse_frame(&mut cursor, &legacy).unwrap()
        else {
            panic!("expected stop sending");
        };
        assert_eq!(stop.error_code, 0x4001);
    }
}
