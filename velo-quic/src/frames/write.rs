//! Frame serialization into a packet builder.
//!
//! Writers check the builder's remaining space before touching it and report
//! "did not fit" as `Ok(None)` / `Ok(0)`; only malformed inputs are errors.
//! Every successful write records the bookkeeping frame via
//! [`PacketBuilder::append_frame`].

use bytes::Bytes;
use core::time::Duration;

use crate::error::{LocalErrorCode, QuicError, QuicResult};
use crate::frames::types::{
    AckBlocks, ConnectionCloseFrame, FrameType, MaxDataFrame, SimpleFrame, StreamTypeField,
    WriteAckFrame, WriteCryptoFrame, WriteFrame, WriteStreamFrame,
};
use crate::packet::builder::PacketBuilder;
use crate::types::{
    quic_integer_size, QuicInteger, StreamId, EIGHT_BYTE_LIMIT, FOUR_BYTE_LIMIT, ONE_BYTE_LIMIT,
    TWO_BYTE_LIMIT,
};

fn packet_space_check(limit: u64, require: usize) -> bool {
    require as u64 <= limit
}

fn frame_type_int(frame_type: FrameType) -> QuicInteger {
    QuicInteger::new(frame_type as u64).expect("frame type fits varint")
}

/// Everything the ACK writer needs: the acked ranges (ascending), the delay,
/// and the negotiated exponent.
#[derive(Debug, Clone)]
pub struct AckFrameMetaData<'a> {
    pub ack_blocks: &'a AckBlocks,
    pub ack_delay: Duration,
    pub ack_delay_exponent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrameWriteResult {
    pub bytes_written: u64,
    pub ack_blocks_written: usize,
}

/// Writes the header of a STREAM frame and returns the number of payload
/// bytes the caller must supply via [`write_stream_frame_data`], or `None`
/// when the frame does not fit.
///
/// The data length is the minimum of the send buffer, the flow-control
/// allowance and the remaining packet space; when the payload reaches the end
/// of the packet the length field is omitted.
pub fn write_stream_frame_header<B: PacketBuilder>(
    builder: &mut B,
    id: StreamId,
    offset: u64,
    write_buffer_len: u64,
    flow_control_len: u64,
    fin: bool,
) -> QuicResult<Option<u64>> {
    if builder.remaining_space_in_pkt() == 0 {
        return Ok(None);
    }
    if write_buffer_len == 0 && !fin {
        return Err(QuicError::local(
            LocalErrorCode::InternalError,
            "no data or fin supplied when writing stream",
        ));
    }
    let mut type_builder = StreamTypeField::builder();
    let id_int = QuicInteger::new(id)?;
    let offset_int = QuicInteger::new(offset)?;
    // Non-optional fields first: frame type and stream id.
    let mut header_size = 1 + id_int.size();
    if offset != 0 {
        type_builder = type_builder.set_offset();
        header_size += offset_int.size();
    }
    if (builder.remaining_space_in_pkt() as usize) < header_size {
        return Ok(None);
    }

    let mut data_len = write_buffer_len.min(flow_control_len);
    let mut data_len_len = 0usize;
    if data_len > 0 && data_len >= (builder.remaining_space_in_pkt() as usize - header_size) as u64
    {
        // Fill the rest of the packet and omit the length field.
        data_len = (builder.remaining_space_in_pkt() as usize - header_size) as u64;
    } else {
        data_len_len = if data_len <= ONE_BYTE_LIMIT - 1 {
            1
        } else if data_len <= TWO_BYTE_LIMIT - 2 {
            2
        } else if data_len <= FOUR_BYTE_LIMIT - 4 {
            4
        } else if data_len <= EIGHT_BYTE_LIMIT - 8 {
            8
        } else {
            return Err(QuicError::local(
                LocalErrorCode::InternalError,
                "stream frame length too large",
            ));
        };
    }
    if data_len_len > 0 {
        if data_len != 0
            && header_size + data_len_len >= builder.remaining_space_in_pkt() as usize
        {
            return Ok(None);
        }
        header_size += data_len_len;
        if (builder.remaining_space_in_pkt() as u64) < data_len + header_size as u64 {
            data_len = builder.remaining_space_in_pkt() as u64 - header_size as u64;
        }
    }
    let should_set_fin = fin && data_len == write_buffer_len;
    if data_len == 0 && !should_set_fin {
        // Would be an empty non-fin stream frame.
        return Ok(None);
    }
    if (builder.remaining_space_in_pkt() as usize) < header_size {
        return Ok(None);
    }

    if data_len_len > 0 {
        type_builder = type_builder.set_length();
    }
    if should_set_fin {
        type_builder = type_builder.set_fin();
    }
    let stream_type = type_builder.build();
    builder.write_u8(stream_type.field_value());
    builder.write_integer(id_int);
    if offset != 0 {
        builder.write_integer(offset_int);
    }
    if data_len_len > 0 {
        builder.write_integer(QuicInteger::new(data_len)?);
    }
    builder.append_frame(WriteFrame::Stream(WriteStreamFrame {
        stream_id: id,
        offset,
        len: data_len,
        fin: stream_type.has_fin(),
    }));
    debug_assert!(data_len <= u64::from(builder.remaining_space_in_pkt()));
    Ok(Some(data_len))
}

/// Copies `data_len` payload bytes into the packet body.
pub fn write_stream_frame_data<B: PacketBuilder>(builder: &mut B, data: &Bytes, data_len: u64) {
    if data_len > 0 {
        builder.insert(data.slice(..data_len as usize));
    }
}

/// Writes a CRYPTO frame, trimming the payload to the remaining space. The
/// length field is clamped to a two-byte slot.
pub fn write_crypto_frame<B: PacketBuilder>(
    offset: u64,
    data: Bytes,
    builder: &mut B,
) -> QuicResult<Option<WriteCryptoFrame>> {
    let space_left = u64::from(builder.remaining_space_in_pkt());
    let int_frame_type = frame_type_int(FrameType::Crypto);
    let offset_int = QuicInteger::new(offset)?;

    let length_bytes = 2usize;
    let crypto_frame_header_size = int_frame_type.size() + offset_int.size() + length_bytes;
    if space_left <= crypto_frame_header_size as u64 {
        return Ok(None);
    }
    let space_remaining = space_left as usize - crypto_frame_header_size;
    let data_length = data.len();
    let writeable_data = data_length.min(space_remaining);
    let length_int = QuicInteger::new(writeable_data as u64)?;
    if length_int.size() > length_bytes {
        return Err(QuicError::local(
            LocalErrorCode::CodecError,
            "crypto frame length does not fit its slot",
        ));
    }
    builder.write_integer(int_frame_type);
    builder.write_integer(offset_int);
    builder.write_integer(length_int);
    builder.insert(data.slice(..writeable_data));
    let frame = WriteCryptoFrame {
        offset,
        len: length_int.value(),
    };
    builder.append_frame(WriteFrame::Crypto(frame));
    Ok(Some(frame))
}

/// Fills `ack_frame` with as many additional blocks as `bytes_limit` allows.
/// The largest block must already be in the frame.
fn fill_frame_with_ack_blocks(
    ack_blocks: &AckBlocks,
    ack_frame: &mut WriteAckFrame,
    mut bytes_limit: u64,
) -> QuicResult<usize> {
    let blocks = ack_blocks.as_slice();
    let mut current_seq_num = blocks.last().expect("caller checked non-empty").start;
    let mut num_additional_blocks = 0usize;
    let mut previous_num_blocks = 0usize;

    // Descending, skipping the largest which is already emplaced.
    for block in blocks.iter().rev().skip(1) {
        debug_assert!(current_seq_num >= block.end + 2);
        let gap = current_seq_num - block.end - 2;
        let block_len = block.end - block.start;

        let gap_size = quic_integer_size(gap)?;
        let block_len_size = quic_integer_size(block_len)?;
        let num_blocks_size = quic_integer_size(num_additional_blocks as u64 + 1)?;
        let previous_num_blocks_size = quic_integer_size(previous_num_blocks as u64)?;

        let additional_size =
            gap_size + block_len_size + (num_blocks_size - previous_num_blocks_size);
        if bytes_limit < additional_size as u64 {
            break;
        }
        num_additional_blocks += 1;
        bytes_limit -= additional_size as u64;
        previous_num_blocks = num_additional_blocks;
        current_seq_num = block.start;
        ack_frame.ack_blocks.push(*block);
    }
    Ok(num_additional_blocks)
}

/// Writes an ACK frame covering as many of the given blocks as fit.
pub fn write_ack_frame<B: PacketBuilder>(
    meta: &AckFrameMetaData<'_>,
    builder: &mut B,
) -> QuicResult<Option<AckFrameWriteResult>> {
    if meta.ack_blocks.is_empty() {
        return Ok(None);
    }
    let blocks = meta.ack_blocks.as_slice();
    // The last block is the largest.
    let largest_acked_packet = blocks.last().unwrap().end;
    let first_ack_block_length = largest_acked_packet - blocks.last().unwrap().start;

    let mut ack_frame = WriteAckFrame::default();
    let space_left = u64::from(builder.remaining_space_in_pkt());
    let beginning_space = space_left;

    let largest_acked_int = QuicInteger::new(largest_acked_packet)?;
    let first_block_int = QuicInteger::new(first_ack_block_length)?;
    let encoded_ack_delay = (meta.ack_delay.as_micros() as u64) >> meta.ack_delay_exponent;
    let ack_delay_int = QuicInteger::new(encoded_ack_delay)?;
    let min_block_count_int = QuicInteger::new(0)?;

    // Required fields: type, largest acked, delay, block count, first block.
    let int_frame_type = frame_type_int(FrameType::Ack);
    let header_size = int_frame_type.size()
        + largest_acked_int.size()
        + ack_delay_int.size()
        + min_block_count_int.size()
        + first_block_int.size();
    if space_left < header_size as u64 {
        return Ok(None);
    }
    let space_for_blocks = space_left - header_size as u64;

    ack_frame.ack_blocks.push(*blocks.last().unwrap());
    let num_additional_blocks =
        fill_frame_with_ack_blocks(meta.ack_blocks, &mut ack_frame, space_for_blocks)?;

    builder.write_integer(int_frame_type);
    builder.write_integer(largest_acked_int);
    builder.write_integer(ack_delay_int);
    builder.write_integer(QuicInteger::new(num_additional_blocks as u64)?);
    builder.write_integer(first_block_int);

    let mut current_seq_num = blocks.last().unwrap().start;
    for block in ack_frame.ack_blocks.iter().skip(1) {
        let gap = current_seq_num - block.end - 2;
        let block_len = block.end - block.start;
        builder.write_integer(QuicInteger::new(gap)?);
        builder.write_integer(QuicInteger::new(block_len)?);
        current_seq_num = block.start;
    }
    ack_frame.ack_delay = meta.ack_delay;
    builder.append_frame(WriteFrame::Ack(ack_frame));
    Ok(Some(AckFrameWriteResult {
        bytes_written: beginning_space - u64::from(builder.remaining_space_in_pkt()),
        ack_blocks_written: 1 + num_additional_blocks,
    }))
}

/// Writes one of the simple frames, returning the bytes consumed, `0` when
/// the frame did not fit.
pub fn write_simple_frame<B: PacketBuilder>(
    frame: SimpleFrame,
    builder: &mut B,
) -> QuicResult<usize> {
    let space_left = u64::from(builder.remaining_space_in_pkt());
    match frame {
        SimpleFrame::Ping(ping) => {
            let int_frame_type = frame_type_int(FrameType::Ping);
            if packet_space_check(space_left, int_frame_type.size()) {
                builder.write_integer(int_frame_type);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::Ping(ping)));
                return Ok(int_frame_type.size());
            }
            Ok(0)
        }
        SimpleFrame::StopSending(stop_sending) => {
            let int_frame_type = frame_type_int(FrameType::StopSending);
            let stream_id = QuicInteger::new(stop_sending.stream_id)?;
            let error_code = QuicInteger::new(stop_sending.error_code)?;
            let error_size = if builder.version().uses_packed_cid_lengths() {
                2
            } else {
                error_code.size()
            };
            let frame_size = int_frame_type.size() + stream_id.size() + error_size;
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                if builder.version().uses_packed_cid_lengths() {
                    builder.write_u16(stop_sending.error_code as u16);
                } else {
                    builder.write_integer(error_code);
                }
                builder.append_frame(WriteFrame::Simple(SimpleFrame::StopSending(stop_sending)));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::MinStreamData(min_stream_data) => {
            let int_frame_type = frame_type_int(FrameType::MinStreamData);
            let stream_id = QuicInteger::new(min_stream_data.stream_id)?;
            let maximum_data = QuicInteger::new(min_stream_data.maximum_data)?;
            let minimum_stream_offset = QuicInteger::new(min_stream_data.minimum_stream_offset)?;
            let frame_size = int_frame_type.size()
                + stream_id.size()
                + maximum_data.size()
                + minimum_stream_offset.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                builder.write_integer(maximum_data);
                builder.write_integer(minimum_stream_offset);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::MinStreamData(
                    min_stream_data,
                )));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::ExpiredStreamData(expired_stream_data) => {
            let int_frame_type = frame_type_int(FrameType::ExpiredStreamData);
            let stream_id = QuicInteger::new(expired_stream_data.stream_id)?;
            let minimum_stream_offset =
                QuicInteger::new(expired_stream_data.minimum_stream_offset)?;
            let frame_size =
                int_frame_type.size() + stream_id.size() + minimum_stream_offset.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                builder.write_integer(minimum_stream_offset);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::ExpiredStreamData(
                    expired_stream_data,
                )));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::PathChallenge(path_challenge) => {
            let int_frame_type = frame_type_int(FrameType::PathChallenge);
            let frame_size = int_frame_type.size() + 8;
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_u64(path_challenge.path_data);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::PathChallenge(
                    path_challenge,
                )));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::PathResponse(path_response) => {
            let int_frame_type = frame_type_int(FrameType::PathResponse);
            let frame_size = int_frame_type.size() + 8;
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_u64(path_response.path_data);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::PathResponse(path_response)));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::NewConnectionId(new_connection_id) => {
            let int_frame_type = frame_type_int(FrameType::NewConnectionId);
            let sequence_number = QuicInteger::new(new_connection_id.sequence_number)?;
            let retire_prior_to = QuicInteger::new(new_connection_id.retire_prior_to)?;
            // One extra byte for the cid length prefix.
            let frame_size = int_frame_type.size()
                + sequence_number.size()
                + retire_prior_to.size()
                + 1
                + new_connection_id.connection_id.len()
                + new_connection_id.token.len();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(sequence_number);
                builder.write_integer(retire_prior_to);
                builder.write_u8(new_connection_id.connection_id.len() as u8);
                builder.push(new_connection_id.connection_id.as_slice());
                builder.push(&new_connection_id.token);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::NewConnectionId(
                    new_connection_id,
                )));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::MaxStreams(max_streams) => {
            let frame_type = if max_streams.is_for_bidirectional {
                FrameType::MaxStreamsBidi
            } else {
                FrameType::MaxStreamsUni
            };
            let int_frame_type = frame_type_int(frame_type);
            let stream_count = QuicInteger::new(max_streams.max_streams)?;
            let frame_size = int_frame_type.size() + stream_count.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_count);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::MaxStreams(max_streams)));
                return Ok(frame_size);
            }
            Ok(0)
        }
        SimpleFrame::RetireConnectionId(retire_connection_id) => {
            let int_frame_type = frame_type_int(FrameType::RetireConnectionId);
            let sequence = QuicInteger::new(retire_connection_id.sequence_number)?;
            let frame_size = int_frame_type.size() + sequence.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(sequence);
                builder.append_frame(WriteFrame::Simple(SimpleFrame::RetireConnectionId(
                    retire_connection_id,
                )));
                return Ok(frame_size);
            }
            Ok(0)
        }
    }
}

/// Writes any non-stream, non-crypto, non-ack frame. Returns bytes consumed,
/// `0` when the frame did not fit.
pub fn write_frame<B: PacketBuilder>(frame: WriteFrame, builder: &mut B) -> QuicResult<usize> {
    let space_left = u64::from(builder.remaining_space_in_pkt());
    match frame {
        WriteFrame::Padding(padding) => {
            let int_frame_type = frame_type_int(FrameType::Padding);
            if packet_space_check(space_left, int_frame_type.size()) {
                builder.write_integer(int_frame_type);
                builder.append_frame(WriteFrame::Padding(padding));
                return Ok(int_frame_type.size());
            }
            Ok(0)
        }
        WriteFrame::RstStream(rst_stream) => {
            let int_frame_type = frame_type_int(FrameType::RstStream);
            let stream_id = QuicInteger::new(rst_stream.stream_id)?;
            let offset = QuicInteger::new(rst_stream.offset)?;
            let error_code = QuicInteger::new(rst_stream.error_code)?;
            let error_size = if builder.version().uses_packed_cid_lengths() {
                2
            } else {
                error_code.size()
            };
            let frame_size =
                int_frame_type.size() + error_size + stream_id.size() + offset.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                if builder.version().uses_packed_cid_lengths() {
                    builder.write_u16(rst_stream.error_code as u16);
                } else {
                    builder.write_integer(error_code);
                }
                builder.write_integer(offset);
                builder.append_frame(WriteFrame::RstStream(rst_stream));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::MaxData(max_data) => {
            let int_frame_type = frame_type_int(FrameType::MaxData);
            let maximum_data = QuicInteger::new(max_data.maximum_data)?;
            let frame_size = int_frame_type.size() + maximum_data.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(maximum_data);
                builder.append_frame(WriteFrame::MaxData(max_data));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::MaxStreamData(max_stream_data) => {
            let int_frame_type = frame_type_int(FrameType::MaxStreamData);
            let stream_id = QuicInteger::new(max_stream_data.stream_id)?;
            let maximum_data = QuicInteger::new(max_stream_data.maximum_data)?;
            let frame_size = int_frame_type.size() + stream_id.size() + maximum_data.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                builder.write_integer(maximum_data);
                builder.append_frame(WriteFrame::MaxStreamData(max_stream_data));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::DataBlocked(blocked) => {
            let int_frame_type = frame_type_int(FrameType::DataBlocked);
            let data_limit = QuicInteger::new(blocked.data_limit)?;
            let frame_size = int_frame_type.size() + data_limit.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(data_limit);
                builder.append_frame(WriteFrame::DataBlocked(blocked));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::StreamDataBlocked(stream_blocked) => {
            let int_frame_type = frame_type_int(FrameType::StreamDataBlocked);
            let stream_id = QuicInteger::new(stream_blocked.stream_id)?;
            let data_limit = QuicInteger::new(stream_blocked.data_limit)?;
            let frame_size = int_frame_type.size() + stream_id.size() + data_limit.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_id);
                builder.write_integer(data_limit);
                builder.append_frame(WriteFrame::StreamDataBlocked(stream_blocked));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::StreamsBlocked(streams_blocked) => {
            let frame_type = if streams_blocked.is_for_bidirectional {
                FrameType::StreamsBlockedBidi
            } else {
                FrameType::StreamsBlockedUni
            };
            let int_frame_type = frame_type_int(frame_type);
            let stream_limit = QuicInteger::new(streams_blocked.stream_limit)?;
            let frame_size = int_frame_type.size() + stream_limit.size();
            if packet_space_check(space_left, frame_size) {
                builder.write_integer(int_frame_type);
                builder.write_integer(stream_limit);
                builder.append_frame(WriteFrame::StreamsBlocked(streams_blocked));
                return Ok(frame_size);
            }
            Ok(0)
        }
        WriteFrame::ConnectionClose(connection_close) => {
            write_connection_close_frame(connection_close, builder)
        }
        WriteFrame::Simple(simple) => write_simple_frame(simple, builder),
        WriteFrame::Ack(_) | WriteFrame::Stream(_) | WriteFrame::Crypto(_) => {
            // These carry payload context the generic path cannot supply.
            Err(QuicError::local(
                LocalErrorCode::CodecError,
                "frame requires its dedicated writer",
            ))
        }
    }
}

fn write_connection_close_frame<B: PacketBuilder>(
    connection_close: ConnectionCloseFrame,
    builder: &mut B,
) -> QuicResult<usize> {
    let space_left = u64::from(builder.remaining_space_in_pkt());
    let is_transport = connection_close.error_code.as_transport().is_some();
    let int_frame_type = frame_type_int(if is_transport {
        FrameType::ConnectionClose
    } else {
        FrameType::ConnectionCloseAppErr
    });
    let reason_length = QuicInteger::new(connection_close.reason_phrase.len() as u64)?;
    // Only the transport-level close names the frame that triggered it.
    let closing_frame_type = if is_transport {
        Some(QuicInteger::new(connection_close.closing_frame_type as u64)?)
    } else {
        None
    };
    let error_code = QuicInteger::new(connection_close.error_code.to_wire())?;
    let error_size = if builder.version().uses_packed_cid_lengths() {
        2
    } else {
        error_code.size()
    };
    let frame_size = int_frame_type.size()
        + error_size
        + closing_frame_type.map(|t| t.size()).unwrap_or(0)
        + reason_length.size()
        + connection_close.reason_phrase.len();
    if packet_space_check(space_left, frame_size) {
        builder.write_integer(int_frame_type);
        if builder.version().uses_packed_cid_lengths() {
            builder.write_u16(connection_close.error_code.to_wire() as u16);
        } else {
            builder.write_integer(error_code);
        }
        if let Some(closing) = closing_frame_type {
            builder.write_integer(closing);
        }
        builder.write_integer(reason_length);
        builder.push(connection_close.reason_phrase.as_bytes());
        builder.append_frame(WriteFrame::ConnectionClose(connection_close));
        return Ok(frame_size);
    }
    Ok(0)
}

// Frame generation helpers used by the rebuilder and the write path: fresh
// flow-control limits are always re-derived from current state, never
// replayed.

/// Builds a MAX_DATA frame from the connection's current receive window.
pub fn generate_max_data_frame(
    sum_cur_read_offset: u64,
    window_size: u64,
    advertised_max_offset: u64,
) -> MaxDataFrame {
    MaxDataFrame {
        maximum_data: advertised_max_offset.max(sum_cur_read_offset + window_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuicErrorCode;
    use crate::frames::parse::{parse_frame, parse_frames, CodecParameters};
    use crate::frames::types::{
        AckBlock, ExpiredStreamDataFrame, MaxStreamsFrame, MinStreamDataFrame,
        NewConnectionIdFrame, PathChallengeFrame, PathResponseFrame, PingFrame, ReadFrame,
        RetireConnectionIdFrame, StopSendingFrame,
    };
    use crate::packet::builder::RegularPacketBuilder;
    use crate::packet::header::{PacketHeader, ProtectionType, ShortHeader};
    use crate::types::{ConnectionId, QuicVersion};

    fn test_builder(space: u32) -> RegularPacketBuilder {
        let header = PacketHeader::Short(
            ShortHeader::new(
                ProtectionType::KeyPhaseZero,
                ConnectionId::new(&[1, 2, 3, 4]).unwrap(),
                0,
            )
            .unwrap(),
        );
        RegularPacketBuilder::new(space, header, 0, QuicVersion::QUIC_V1)
    }

    #[test]
    fn simple_frames_round_trip() {
        let mut builder = test_builder(1200);
        let frames = [
            SimpleFrame::Ping(PingFrame),
            SimpleFrame::StopSending(StopSendingFrame {
                stream_id: 4,
                error_code: 0x77,
            }),
            SimpleFrame::PathChallenge(PathChallengeFrame {
                path_data: 0xdead_beef_cafe_f00d,
            }),
            SimpleFrame::PathResponse(PathResponseFrame { path_data: 42 }),
            SimpleFrame::MaxStreams(MaxStreamsFrame {
                max_streams: 128,
                is_for_bidirectional: true,
            }),
            SimpleFrame::RetireConnectionId(RetireConnectionIdFrame { sequence_number: 3 }),
            SimpleFrame::MinStreamData(MinStreamDataFrame {
                stream_id: 8,
                maximum_data: 4000,
                minimum_stream_offset: 2000,
            }),
            SimpleFrame::ExpiredStreamData(ExpiredStreamDataFrame {
                stream_id: 8,
                minimum_stream_offset: 2000,
            }),
            SimpleFrame::NewConnectionId(NewConnectionIdFrame {
                sequence_number: 1,
                retire_prior_to: 0,
                connection_id: ConnectionId::new(&[9, 8, 7, 6]).unwrap(),
                token: [0xbb; 16],
            }),
        ];
        for frame in &frames {
            assert!(write_simple_frame(frame.clone(), &mut builder).unwrap() > 0);
        }
        let built = builder.build();
        let mut cursor = &built.body[..];
        let parsed = parse_frames(&mut cursor, &CodecParameters::default()).unwrap();
        let round_tripped: Vec<SimpleFrame> = parsed
            .into_iter()
            .filter_map(|f| match f {
                ReadFrame::Simple(simple) => Some(simple),
                ReadFrame::Padding(_) => None,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(&round_tripped[..], &frames[..]);
    }

    #[test]
    fn simple_frame_no_space_returns_zero() {
        let mut builder = test_builder(7);
        // Header consumed 6 bytes; nothing fits a PATH_CHALLENGE (9 bytes).
        let written = write_simple_frame(
            SimpleFrame::PathChallenge(PathChallengeFrame { path_data: 1 }),
            &mut builder,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert_eq!(builder.build().packet.frames.len(), 0);
    }

    #[test]
    fn stream_frame_header_with_explicit_length() {
        let mut builder = test_builder(1200);
        let written =
            write_stream_frame_header(&mut builder, 4, 100, 50, 1000, false).unwrap();
        assert_eq!(written, Some(50));
        write_stream_frame_data(&mut builder, &Bytes::from(vec![0xaa; 50]), 50);
        let built = builder.build();
        let mut cursor = &built.body[..];
        let ReadFrame::Stream(stream) =
            parse_frame(&mut cursor, &CodecParameters::default()).unwrap()
        else {
            panic!("expected stream frame");
        };
        assert_eq!(stream.stream_id, 4);
        assert_eq!(stream.offset, 100);
        assert_eq!(stream.data.len(), 50);
        assert!(!stream.fin);
    }

    #[test]
    fn stream_frame_fills_packet_and_omits_length() {
        let mut builder = test_builder(100);
        let space = builder.remaining_space_in_pkt() as u64;
        let written =
            write_stream_frame_header(&mut builder, 0, 0, 1000, 1000, false).unwrap();
        // Type byte + stream id consumed 2 bytes; everything else is payload.
        assert_eq!(written, Some(space - 2));
        let frames = {
            write_stream_frame_data(&mut builder, &Bytes::from(vec![1; (space - 2) as usize]), space - 2);
            builder.build().packet.frames
        };
        let WriteFrame::Stream(recorded) = &frames[0] else {
            panic!("expected stream frame");
        };
        assert_eq!(recorded.len, space - 2);
    }

    #[test]
    fn stream_frame_fin_only_when_all_data_fits() {
        let mut builder = test_builder(1200);
        // Buffer 100 bytes, fin set, but flow control only allows 10.
        let written = write_stream_frame_header(&mut builder, 4, 0, 100, 10, true).unwrap();
        assert_eq!(written, Some(10));
        let built = builder.build();
        let WriteFrame::Stream(recorded) = &built.packet.frames[0] else {
            panic!("expected stream frame");
        };
        assert!(!recorded.fin, "fin must wait for the rest of the data");
    }

    #[test]
    fn empty_non_fin_stream_frame_is_an_error() {
        let mut builder = test_builder(1200);
        assert!(write_stream_frame_header(&mut builder, 4, 0, 0, 100, false).is_err());
    }

    #[test]
    fn crypto_frame_trims_to_space() {
        let mut builder = test_builder(50);
        // 44 bytes left after the short header; the writer reserves a
        // two-byte length slot but emits the minimal varint.
        assert_eq!(builder.remaining_space_in_pkt(), 44);
        let data = Bytes::from(vec![7u8; 200]);
        let frame = write_crypto_frame(0, data, &mut builder).unwrap().unwrap();
        assert_eq!(frame.len, 40);
        assert_eq!(builder.remaining_space_in_pkt(), 1);
    }

    #[test]
    fn ack_frame_round_trip() {
        let mut builder = test_builder(1200);
        let mut blocks = AckBlocks::new();
        blocks.insert(1, 10);
        blocks.insert(20, 30);
        blocks.insert(45, 50);
        let meta = AckFrameMetaData {
            ack_blocks: &blocks,
            ack_delay: Duration::from_micros(800),
            ack_delay_exponent: 3,
        };
        let result = write_ack_frame(&meta, &mut builder).unwrap().unwrap();
        assert_eq!(result.ack_blocks_written, 3);
        let built = builder.build();
        let mut cursor = &built.body[..];
        let ReadFrame::Ack(ack) = parse_frame(&mut cursor, &CodecParameters::default()).unwrap()
        else {
            panic!("expected ack frame");
        };
        assert_eq!(ack.largest_acked, 50);
        assert_eq!(ack.ack_delay, Duration::from_micros(800));
        assert_eq!(ack.ack_blocks.as_slice().len(), 3);
        assert_eq!(ack.ack_blocks[0], AckBlock::new(45, 50));
        assert_eq!(ack.ack_blocks[1], AckBlock::new(20, 30));
        assert_eq!(ack.ack_blocks[2], AckBlock::new(1, 10));
    }

    #[test]
    fn ack_frame_respects_space_limit() {
        // Big enough for the header but not all blocks.
        let mut builder = test_builder(20);
        let mut blocks = AckBlocks::new();
        for i in 0..50u64 {
            blocks.insert(i * 10, i * 10 + 2);
        }
        let meta = AckFrameMetaData {
            ack_blocks: &blocks,
            ack_delay: Duration::ZERO,
            ack_delay_exponent: 3,
        };
        let result = write_ack_frame(&meta, &mut builder).unwrap().unwrap();
        assert!(result.ack_blocks_written < 50);
    }

    #[test]
    fn connection_close_uses_app_err_type_code() {
        let mut builder = test_builder(1200);
        let frame = ConnectionCloseFrame::new(
            QuicErrorCode::Application(0x99),
            "app closed".to_string(),
        );
        assert!(write_frame(WriteFrame::ConnectionClose(frame), &mut builder).unwrap() > 0);
        let built = builder.build();
        // First body byte is the APP_ERR type code.
        assert_eq!(built.body[0], 0x1d);
        let mut cursor = &built.body[..];
        let ReadFrame::ConnectionClose(parsed) =
            parse_frame(&mut cursor, &CodecParameters::default()).unwrap()
        else {
            panic!("expected close frame");
        };
        assert_eq!(parsed.error_code, QuicErrorCode::Application(0x99));
        assert_eq!(parsed.reason_phrase, "app closed");
    }

    #[test]
    fn max_data_frame_generation_uses_fresh_state() {
        let frame = generate_max_data_frame(5000, 1000, 4000);
        assert_eq!(frame.maximum_data, 6000);
        // Never regress below what was already advertised.
        let frame = generate_max_data_frame(100, 100, 4000);
        assert_eq!(frame.maximum_data, 4000);
    }
}
