//! Rebuilds an outstanding packet's still-meaningful frames into a fresh
//! builder for PTO-triggered retransmission.
//!
//! Frames referencing vanished state (closed streams, acked data, finished
//! path validations) are skipped quietly. Flow-control limits are re-derived
//! from current state, never replayed. A rebuild that ends up carrying
//! nothing but ACK and PADDING produces no clone.

use bytes::Bytes;

use crate::connection::simple_frames::update_simple_frame_on_packet_clone;
use crate::connection::state::{OutstandingPacket, PacketEvent, QuicConnectionState};
use crate::connection::streams::{stream_frame_matches_retransmit_buffer, StreamBuffer};
use crate::error::QuicResult;
use crate::frames::types::{WriteCryptoFrame, WriteFrame, WriteStreamFrame};
use crate::frames::write::{
    generate_max_data_frame, write_ack_frame, write_crypto_frame, write_frame, write_simple_frame,
    write_stream_frame_data, write_stream_frame_header, AckFrameMetaData,
};
use crate::frames::AckBlocks;
use crate::packet::builder::{PacketBuilder, RegularPacketBuilder};
use crate::packet::header::{HeaderForm, ProtectionType};
use crate::types::DEFAULT_ACK_DELAY_EXPONENT;

pub struct PacketRebuilder<'a> {
    builder: &'a mut RegularPacketBuilder,
    conn: &'a mut QuicConnectionState,
}

impl<'a> PacketRebuilder<'a> {
    pub fn new(builder: &'a mut RegularPacketBuilder, conn: &'a mut QuicConnectionState) -> Self {
        Self { builder, conn }
    }

    pub fn header_bytes(&self) -> u32 {
        self.builder.header_bytes()
    }

    /// Mints or reuses the clone event for `packet`, registering it in the
    /// connection-wide set. A packet is cloned either never before, or with
    /// its event still present in that set.
    fn clone_outstanding_packet(&mut self, packet: &mut OutstandingPacket) -> PacketEvent {
        debug_assert!(packet
            .associated_event
            .map_or(true, |event| self.conn.outstanding_packet_events.contains(&event)));
        if packet.associated_event.is_none() {
            let packet_num = packet.packet.header.packet_sequence_num();
            debug_assert!(!self.conn.outstanding_packet_events.contains(&packet_num));
            packet.associated_event = Some(packet_num);
            self.conn.outstanding_packet_events.insert(packet_num);
            self.conn.outstanding_cloned_packets_count += 1;
        }
        packet.associated_event.expect("set above")
    }

    /// Re-encodes the packet's frames into the builder. Returns the clone
    /// event on success, `None` when the packet is not worth cloning or a
    /// required re-emit did not fit.
    pub fn rebuild_from_packet(
        &mut self,
        packet: &mut OutstandingPacket,
    ) -> QuicResult<Option<PacketEvent>> {
        let mut write_success = false;
        let mut window_update_written = false;
        let mut should_write_window_update = false;
        let mut not_pure_ack = false;

        let frames = packet.packet.frames.clone();
        for frame in &frames {
            match frame {
                WriteFrame::Ack(ack_frame) => {
                    // Long headers always use the default exponent; the
                    // negotiated one applies only to 1-RTT packets.
                    let ack_delay_exponent =
                        match self.builder.packet_header().header_form() {
                            HeaderForm::Long => DEFAULT_ACK_DELAY_EXPONENT,
                            HeaderForm::Short => self.conn.transport_settings.ack_delay_exponent,
                        };
                    let mut ack_blocks = AckBlocks::new();
                    for block in &ack_frame.ack_blocks {
                        ack_blocks.insert(block.start, block.end);
                    }
                    let meta = AckFrameMetaData {
                        ack_blocks: &ack_blocks,
                        ack_delay: ack_frame.ack_delay,
                        ack_delay_exponent,
                    };
                    write_success = write_ack_frame(&meta, self.builder)?.is_some();
                }
                WriteFrame::Stream(stream_frame) => {
                    let stream = self.conn.streams.get_stream(stream_frame.stream_id);
                    match stream {
                        Some(stream) if stream.retransmittable() => {
                            let Some(stream_data) = clone_retransmission_buffer(
                                stream_frame,
                                stream.retransmission_buffer.get(&stream_frame.offset),
                            ) else {
                                // Already acked, lost, or skipped; drop quietly.
                                write_success = true;
                                continue;
                            };
                            let buffer_len = stream_data.len() as u64;
                            let data_len = write_stream_frame_header(
                                self.builder,
                                stream_frame.stream_id,
                                stream_frame.offset,
                                buffer_len,
                                buffer_len,
                                stream_frame.fin,
                            )?;
                            if data_len == Some(stream_frame.len) {
                                write_stream_frame_data(
                                    self.builder,
                                    &stream_data,
                                    stream_frame.len,
                                );
                                not_pure_ack = true;
                                write_success = true;
                            } else {
                                write_success = false;
                            }
                        }
                        // A closed or reset stream's data is not resent;
                        // count the frame as handled and move on.
                        _ => {
                            write_success = true;
                        }
                    }
                }
                WriteFrame::Crypto(crypto_frame) => {
                    // Initial and handshake crypto lives in handshake
                    // packets, which are not cloneable.
                    debug_assert!(!packet.is_handshake);
                    debug_assert_eq!(
                        packet.packet.header.protection_type(),
                        ProtectionType::KeyPhaseZero
                    );
                    let buf = clone_crypto_retransmission_buffer(
                        crypto_frame,
                        self.conn
                            .crypto_state
                            .one_rtt_stream
                            .retransmission_buffer
                            .get(&crypto_frame.offset),
                    );
                    let Some(buf) = buf else {
                        // Crypto stream canceled; skip this frame.
                        write_success = true;
                        continue;
                    };
                    let result = write_crypto_frame(crypto_frame.offset, buf, self.builder)?;
                    let ret = result.map_or(false, |written| {
                        written.offset == crypto_frame.offset && written.len == crypto_frame.len
                    });
                    not_pure_ack |= ret;
                    write_success = ret;
                }
                WriteFrame::MaxData(_) => {
                    should_write_window_update = true;
                    let fresh = generate_max_data_frame(
                        self.conn.flow_control.sum_cur_read_offset,
                        self.conn.flow_control.window_size,
                        self.conn.flow_control.advertised_max_offset,
                    );
                    let ret = write_frame(WriteFrame::MaxData(fresh), self.builder)? != 0;
                    window_update_written |= ret;
                    not_pure_ack |= ret;
                    write_success = true;
                }
                WriteFrame::MaxStreamData(max_stream_data) => {
                    let Some(stream) = self.conn.streams.get_stream(max_stream_data.stream_id)
                    else {
                        write_success = true;
                        continue;
                    };
                    if !stream.should_send_flow_control() {
                        write_success = true;
                        continue;
                    }
                    should_write_window_update = true;
                    let fresh = stream.generate_max_stream_data();
                    let ret = write_frame(WriteFrame::MaxStreamData(fresh), self.builder)? != 0;
                    window_update_written |= ret;
                    not_pure_ack |= ret;
                    write_success = true;
                }
                WriteFrame::Padding(padding) => {
                    write_success = write_frame(WriteFrame::Padding(*padding), self.builder)? != 0;
                }
                WriteFrame::Simple(simple_frame) => {
                    let updated = update_simple_frame_on_packet_clone(self.conn, simple_frame);
                    let Some(updated) = updated else {
                        write_success = true;
                        continue;
                    };
                    let ret = write_simple_frame(updated, self.builder)? != 0;
                    not_pure_ack |= ret;
                    write_success = ret;
                }
                other => {
                    let ret = write_frame(other.clone(), self.builder)? != 0;
                    not_pure_ack |= ret;
                    write_success = ret;
                }
            }
            if !write_success {
                return Ok(None);
            }
        }
        // No clone when (1) only acks and paddings were re-emitted, or
        // (2) a window update was due, none was written, and nothing else
        // succeeded either.
        if !not_pure_ack
            || (should_write_window_update && !window_update_written && !write_success)
        {
            return Ok(None);
        }
        Ok(Some(self.clone_outstanding_packet(packet)))
    }
}

/// The retransmission-buffer data for a stream frame being cloned, or `None`
/// when the buffer entry is gone or no longer matches.
///
/// A chunk is removed on RST, on ack, on loss, or when skipped by a received
/// MIN_STREAM_DATA; a trimmed chunk fails the exact match and is skipped
/// conservatively.
fn clone_retransmission_buffer(
    frame: &WriteStreamFrame,
    buffer: Option<&StreamBuffer>,
) -> Option<Bytes> {
    let buffer = buffer?;
    if !stream_frame_matches_retransmit_buffer(frame, buffer) {
        return None;
    }
    debug_assert!(frame.len == 0 || !buffer.data.is_empty());
    Some(buffer.data.clone())
}

/// Crypto chunks leave the buffer when their packet is acked or marked lost;
/// a miss means the clone is simply skipped.
fn clone_crypto_retransmission_buffer(
    frame: &WriteCryptoFrame,
    buffer: Option<&StreamBuffer>,
) -> Option<Bytes> {
    debug_assert!(frame.len > 0, "cloning an empty crypto frame");
    let buffer = buffer?;
    debug_assert_eq!(buffer.offset, frame.offset);
    debug_assert_eq!(buffer.data.len() as u64, frame.len);
    Some(buffer.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::connection::state::QuicConnectionState;
    use crate::frames::types::{
        AckBlock, MaxDataFrame, MaxStreamDataFrame, PaddingFrame, PathResponseFrame, PingFrame,
        SimpleFrame, WriteAckFrame,
    };
    use crate::packet::header::{PacketHeader, ProtectionType, ShortHeader};
    use crate::packet::RegularWritePacket;
    use crate::types::{ConnectionId, PacketNum, QuicNodeType, QuicVersion};

    fn short_header(pn: PacketNum) -> PacketHeader {
        PacketHeader::Short(
            ShortHeader::new(
                ProtectionType::KeyPhaseZero,
                ConnectionId::new(&[1, 2, 3, 4]).unwrap(),
                pn,
            )
            .unwrap(),
        )
    }

    fn builder(pn: PacketNum) -> RegularPacketBuilder {
        RegularPacketBuilder::new(1200, short_header(pn), 0, QuicVersion::QUIC_V1)
    }

    fn outstanding(frames: Vec<WriteFrame>, pn: PacketNum) -> OutstandingPacket {
        let mut packet = RegularWritePacket::new(short_header(pn));
        packet.frames.extend(frames);
        OutstandingPacket::new(packet, Instant::now(), 1000, false)
    }

    fn conn_with_stream(data_len: usize) -> QuicConnectionState {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let stream = conn.streams.create_stream(0);
        stream.insert_into_retransmission_buffer(
            0,
            Bytes::from(vec![0xabu8; data_len]),
            false,
        );
        conn
    }

    fn stream_frame(len: u64) -> WriteFrame {
        WriteFrame::Stream(WriteStreamFrame {
            stream_id: 0,
            offset: 0,
            len,
            fin: false,
        })
    }

    #[test]
    fn rebuild_stream_frame_produces_clone_event() {
        let mut conn = conn_with_stream(100);
        let mut packet = outstanding(vec![stream_frame(100)], 3);
        let mut regular = builder(7);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert_eq!(event, Some(3));
        assert_eq!(packet.associated_event, Some(3));
        assert!(conn.outstanding_packet_events.contains(&3));
        assert_eq!(conn.outstanding_cloned_packets_count, 1);
    }

    #[test]
    fn rebuild_twice_reuses_the_same_event() {
        let mut conn = conn_with_stream(100);
        let mut packet = outstanding(vec![stream_frame(100)], 3);

        let mut first = builder(7);
        let event_a = PacketRebuilder::new(&mut first, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        let body_a = first.build().body;

        let mut second = builder(8);
        let event_b = PacketRebuilder::new(&mut second, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        let body_b = second.build().body;

        assert_eq!(event_a, event_b);
        assert_eq!(conn.outstanding_packet_events.len(), 1);
        assert_eq!(conn.outstanding_cloned_packets_count, 1);
        // Rebuilding is deterministic: same bytes modulo the packet number,
        // which lives in the header.
        assert_eq!(body_a, body_b);
    }

    #[test]
    fn pure_ack_packet_is_not_cloned() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let ack = WriteFrame::Ack(WriteAckFrame {
            ack_blocks: vec![AckBlock::new(0, 10)],
            ack_delay: core::time::Duration::from_micros(100),
        });
        let mut packet = outstanding(vec![ack, WriteFrame::Padding(PaddingFrame)], 1);
        let mut regular = builder(2);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert!(event.is_none());
        assert!(packet.associated_event.is_none());
        assert!(conn.outstanding_packet_events.is_empty());
    }

    #[test]
    fn vanished_stream_data_is_skipped_quietly() {
        // Stream exists but its retransmission buffer was drained by an ack.
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.streams.create_stream(0);
        let mut packet = outstanding(
            vec![
                stream_frame(100),
                WriteFrame::Simple(SimpleFrame::Ping(PingFrame)),
            ],
            5,
        );
        let mut regular = builder(9);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        // The ping still makes the clone worthwhile.
        assert!(event.is_some());
        let built = regular.build();
        // Only the PING made it out.
        assert_eq!(built.packet.frames.len(), 1);
    }

    #[test]
    fn closed_stream_is_skipped() {
        let mut conn = conn_with_stream(100);
        conn.streams.get_stream_mut(0).unwrap().send_state =
            crate::connection::streams::StreamSendState::Closed;
        let mut packet = outstanding(vec![stream_frame(100)], 5);
        let mut regular = builder(9);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        // Nothing but the skipped stream: pure-ack rule says no clone.
        assert!(event.is_none());
    }

    #[test]
    fn max_data_is_rederived_from_current_state() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.flow_control.sum_cur_read_offset = 7000;
        conn.flow_control.window_size = 1000;
        let stale = WriteFrame::MaxData(MaxDataFrame { maximum_data: 100 });
        let mut packet = outstanding(vec![stale], 2);
        let mut regular = builder(3);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert!(event.is_some());
        let built = regular.build();
        let WriteFrame::MaxData(fresh) = &built.packet.frames[0] else {
            panic!("expected MAX_DATA");
        };
        assert_eq!(fresh.maximum_data, 8000);
    }

    #[test]
    fn max_stream_data_skipped_when_no_update_wanted() {
        let mut conn = conn_with_stream(10);
        let frame = WriteFrame::MaxStreamData(MaxStreamDataFrame {
            stream_id: 0,
            maximum_data: 500,
        });
        let mut packet = outstanding(vec![frame], 2);
        let mut regular = builder(3);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert!(event.is_none());
        assert_eq!(regular.build().packet.frames.len(), 0);
    }

    #[test]
    fn path_response_is_never_cloned() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let frame = WriteFrame::Simple(SimpleFrame::PathResponse(PathResponseFrame {
            path_data: 9,
        }));
        let mut packet = outstanding(vec![frame], 2);
        let mut regular = builder(3);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn crypto_frame_cloned_from_one_rtt_stream() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.crypto_state.one_rtt_stream.retransmission_buffer.insert(
            0,
            StreamBuffer {
                data: Bytes::from(vec![0x11u8; 64]),
                offset: 0,
                eof: false,
            },
        );
        let frame = WriteFrame::Crypto(WriteCryptoFrame { offset: 0, len: 64 });
        let mut packet = outstanding(vec![frame], 4);
        let mut regular = builder(5);
        let event = PacketRebuilder::new(&mut regular, &mut conn)
            .rebuild_from_packet(&mut packet)
            .unwrap();
        assert!(event.is_some());
        let built = regular.build();
        let WriteFrame::Crypto(cloned) = &built.packet.frames[0] else {
            panic!("expected CRYPTO");
        };
        assert_eq!(cloned.len, 64);
    }
}
