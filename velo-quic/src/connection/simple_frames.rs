//! The shared lifecycle processor for simple frames.
//!
//! Five entry points cover a simple frame's life: queueing for send, leaving
//! the pending queue on packet send, acknowledgment, filtering on packet
//! clone, re-queueing on loss, and dispatch on receive. All functions take
//! `&mut QuicConnectionState`; none keeps a reference behind.

use std::time::Instant;

use tracing::debug;

use crate::connection::state::{update_rtt, QuicConnectionState};
use crate::connection::streams::{
    advance_current_receive_offset, advance_minimum_retransmittable_offset,
};
use crate::error::{QuicError, QuicResult, TransportErrorCode};
use crate::frames::types::{PathResponseFrame, SimpleFrame};
use crate::types::{ConnectionIdData, PacketNum};

/// Queues a frame for inclusion in the next write.
pub fn send_simple_frame(conn: &mut QuicConnectionState, frame: SimpleFrame) {
    conn.pending_events.frames.push(frame);
}

/// The containing packet was acknowledged.
pub fn update_simple_frame_on_ack(conn: &mut QuicConnectionState, frame: &SimpleFrame) {
    if let SimpleFrame::Ping(_) = frame {
        conn.pending_events.cancel_ping_timeout = true;
    }
}

/// Filters a frame for the clone path: returns the frame to re-emit, or
/// `None` when its referent disappeared.
pub fn update_simple_frame_on_packet_clone(
    conn: &QuicConnectionState,
    frame: &SimpleFrame,
) -> Option<SimpleFrame> {
    match frame {
        SimpleFrame::Ping(_) => Some(frame.clone()),
        SimpleFrame::StopSending(stop_sending) => {
            if !conn.streams.stream_exists(stop_sending.stream_id) {
                return None;
            }
            Some(frame.clone())
        }
        SimpleFrame::MinStreamData(min_stream_data) => {
            if !conn.streams.stream_exists(min_stream_data.stream_id) {
                return None;
            }
            Some(frame.clone())
        }
        SimpleFrame::ExpiredStreamData(expired_stream_data) => {
            if !conn.streams.stream_exists(expired_stream_data.stream_id) {
                return None;
            }
            Some(frame.clone())
        }
        SimpleFrame::PathChallenge(path_challenge) => {
            // Validation timed out or a different validation was scheduled.
            match &conn.outstanding_path_validation {
                Some(outstanding) if outstanding == path_challenge => Some(frame.clone()),
                _ => None,
            }
        }
        // Never cloned, to avoid buffering stale responses.
        SimpleFrame::PathResponse(_) => None,
        SimpleFrame::NewConnectionId(_)
        | SimpleFrame::MaxStreams(_)
        | SimpleFrame::RetireConnectionId(_) => Some(frame.clone()),
    }
}

/// The frame left in a packet: remove it from the pending queue.
/// PATH_CHALLENGE instead moves into the outstanding-validation slot and
/// starts the validation clock.
pub fn update_simple_frame_on_packet_sent(
    conn: &mut QuicConnectionState,
    frame: &SimpleFrame,
    now: Instant,
) {
    match frame {
        SimpleFrame::PathChallenge(_) => {
            conn.outstanding_path_validation = conn.pending_events.path_challenge.take();
            conn.pending_events.schedule_path_validation_timeout = true;
            conn.path_challenge_start_time = Some(now);
        }
        _ => {
            let frames = &mut conn.pending_events.frames;
            let position = frames.iter().position(|pending| pending == frame);
            debug_assert!(position.is_some(), "sent frame was not pending");
            if let Some(position) = position {
                frames.remove(position);
            }
        }
    }
}

/// The containing packet was declared lost: re-queue what still applies.
pub fn update_simple_frame_on_packet_loss(conn: &mut QuicConnectionState, frame: &SimpleFrame) {
    match frame {
        SimpleFrame::Ping(_) => {}
        SimpleFrame::StopSending(stop_sending) => {
            if conn.streams.stream_exists(stop_sending.stream_id) {
                conn.pending_events.frames.push(frame.clone());
            }
        }
        SimpleFrame::MinStreamData(min_stream_data) => {
            // Informational to the peer; advance our own offset even on loss.
            if conn.transport_settings.partial_reliability_enabled {
                if let Some(stream) = conn.streams.get_stream_mut(min_stream_data.stream_id) {
                    advance_current_receive_offset(
                        stream,
                        min_stream_data.minimum_stream_offset,
                        &mut conn.pending_events.frames,
                    );
                }
            }
        }
        SimpleFrame::ExpiredStreamData(expired_stream_data) => {
            if conn.transport_settings.partial_reliability_enabled {
                if let Some(stream) = conn.streams.get_stream_mut(expired_stream_data.stream_id) {
                    advance_minimum_retransmittable_offset(
                        stream,
                        expired_stream_data.minimum_stream_offset,
                        &mut conn.pending_events.frames,
                    );
                }
            }
        }
        SimpleFrame::PathChallenge(path_challenge) => {
            if conn
                .outstanding_path_validation
                .as_ref()
                .is_some_and(|outstanding| outstanding == path_challenge)
            {
                conn.pending_events.path_challenge = Some(*path_challenge);
            }
        }
        // Not retransmitted, to avoid buffering stale responses.
        SimpleFrame::PathResponse(_) => {}
        SimpleFrame::NewConnectionId(_)
        | SimpleFrame::MaxStreams(_)
        | SimpleFrame::RetireConnectionId(_) => {
            conn.pending_events.frames.push(frame.clone());
        }
    }
}

/// Dispatches a received simple frame. The return value is whether the
/// containing packet counts as retransmittable for the ack-scheduling
/// decision.
pub fn update_simple_frame_on_packet_received(
    conn: &mut QuicConnectionState,
    frame: &SimpleFrame,
    packet_num: PacketNum,
    from_changed_peer_address: bool,
    now: Instant,
) -> QuicResult<bool> {
    match frame {
        SimpleFrame::Ping(_) => Ok(true),
        SimpleFrame::StopSending(stop_sending) => {
            conn.streams.on_stop_sending(stop_sending.stream_id, stop_sending);
            Ok(true)
        }
        SimpleFrame::MinStreamData(min_stream_data) => {
            if conn.transport_settings.partial_reliability_enabled {
                conn.streams.on_recv_min_stream_data(
                    conn.node_type,
                    min_stream_data,
                    packet_num,
                    &mut conn.pending_events.frames,
                )?;
            }
            Ok(true)
        }
        SimpleFrame::ExpiredStreamData(expired_stream_data) => {
            if conn.transport_settings.partial_reliability_enabled {
                conn.streams.on_recv_expired_stream_data(
                    conn.node_type,
                    expired_stream_data,
                    &mut conn.pending_events.frames,
                )?;
            }
            Ok(true)
        }
        SimpleFrame::PathChallenge(path_challenge) => {
            let rotated_id = conn.retire_and_switch_peer_connection_ids();
            if !rotated_id {
                return Err(QuicError::transport(
                    TransportErrorCode::InvalidMigration,
                    "no more connection ids to use for new path",
                ));
            }
            conn.pending_events
                .frames
                .push(SimpleFrame::PathResponse(PathResponseFrame {
                    path_data: path_challenge.path_data,
                }));
            Ok(false)
        }
        SimpleFrame::PathResponse(path_response) => {
            // Ignore responses from a different address or that do not match
            // the outstanding challenge.
            let matches = conn
                .outstanding_path_validation
                .as_ref()
                .is_some_and(|outstanding| outstanding.path_data == path_response.path_data);
            if from_changed_peer_address || !matches {
                return Ok(false);
            }
            if let Some(qlogger) = conn.qlogger.as_mut() {
                qlogger.add_path_validation_event(true);
            }
            conn.outstanding_path_validation = None;
            conn.pending_events.schedule_path_validation_timeout = false;

            if let Some(start) = conn.path_challenge_start_time.take() {
                let sample = now.saturating_duration_since(start);
                update_rtt(conn, sample, core::time::Duration::ZERO);
            }
            Ok(false)
        }
        SimpleFrame::NewConnectionId(new_connection_id) => {
            if new_connection_id.retire_prior_to > new_connection_id.sequence_number {
                return Err(QuicError::transport(
                    TransportErrorCode::ProtocolViolation,
                    "retire prior to greater than sequence number",
                ));
            }

            for existing in &conn.peer_connection_ids {
                if existing.conn_id == new_connection_id.connection_id {
                    if existing.sequence_number != new_connection_id.sequence_number {
                        return Err(QuicError::transport(
                            TransportErrorCode::ProtocolViolation,
                            "repeated connection id with different sequence number",
                        ));
                    }
                    // No-op on an exact duplicate.
                    return Ok(false);
                }
            }

            // The peer-connection-id set holds every peer id, the initial one
            // included; a zero-length scheme admits no alternatives at all.
            let peer_conn_id = conn.peer_connection_id();
            if peer_conn_id.map_or(true, |cid| cid.is_empty()) {
                return Err(QuicError::transport(
                    TransportErrorCode::ProtocolViolation,
                    "endpoint is already using zero-length connection ids",
                ));
            }

            // active_connection_id_limit caps ids supplied by the peer; plus
            // one for the initial id. Beyond that the frame is ignored.
            if conn.peer_connection_ids.len() as u64
                == conn.transport_settings.self_active_connection_id_limit + 1
            {
                debug!(
                    sequence_number = new_connection_id.sequence_number,
                    "ignoring NEW_CONNECTION_ID beyond the active id limit"
                );
                return Ok(false);
            }
            conn.peer_connection_ids.push(ConnectionIdData::new(
                new_connection_id.connection_id,
                new_connection_id.sequence_number,
                Some(new_connection_id.token),
            ));
            Ok(false)
        }
        SimpleFrame::MaxStreams(max_streams) => {
            if max_streams.is_for_bidirectional {
                conn.streams
                    .set_max_local_bidirectional_streams(max_streams.max_streams);
            } else {
                conn.streams
                    .set_max_local_unidirectional_streams(max_streams.max_streams);
            }
            Ok(true)
        }
        SimpleFrame::RetireConnectionId(_) => {
            // Retirement itself is the cid store's concern.
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::types::{
        MaxStreamsFrame, NewConnectionIdFrame, PathChallengeFrame, PingFrame,
        RetireConnectionIdFrame, StopSendingFrame,
    };
    use crate::types::{ConnectionId, QuicNodeType};

    fn cid(data: &[u8]) -> ConnectionId {
        ConnectionId::new(data).unwrap()
    }

    fn conn_with_peer_ids(spares: usize) -> QuicConnectionState {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.server_connection_id = Some(cid(&[0, 0, 0, 0]));
        conn.peer_connection_ids
            .push(ConnectionIdData::new(cid(&[0, 0, 0, 0]), 0, None));
        for i in 0..spares {
            conn.peer_connection_ids.push(ConnectionIdData::new(
                cid(&[1 + i as u8; 4]),
                1 + i as u64,
                None,
            ));
        }
        conn
    }

    #[test]
    fn send_and_sent_round_trip() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let frame = SimpleFrame::StopSending(StopSendingFrame {
            stream_id: 4,
            error_code: 1,
        });
        send_simple_frame(&mut conn, frame.clone());
        assert_eq!(conn.pending_events.frames.len(), 1);
        update_simple_frame_on_packet_sent(&mut conn, &frame, Instant::now());
        assert!(conn.pending_events.frames.is_empty());
    }

    #[test]
    fn path_challenge_sent_moves_to_outstanding() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let challenge = PathChallengeFrame { path_data: 0x42 };
        conn.pending_events.path_challenge = Some(challenge);
        update_simple_frame_on_packet_sent(
            &mut conn,
            &SimpleFrame::PathChallenge(challenge),
            Instant::now(),
        );
        assert_eq!(conn.outstanding_path_validation, Some(challenge));
        assert!(conn.pending_events.schedule_path_validation_timeout);
        assert!(conn.path_challenge_start_time.is_some());
        assert!(conn.pending_events.path_challenge.is_none());
    }

    #[test]
    fn ping_ack_cancels_ping_timeout() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        update_simple_frame_on_ack(&mut conn, &SimpleFrame::Ping(PingFrame));
        assert!(conn.pending_events.cancel_ping_timeout);
    }

    #[test]
    fn clone_filters_vanished_stream() {
        let conn = QuicConnectionState::new(QuicNodeType::Client);
        let frame = SimpleFrame::StopSending(StopSendingFrame {
            stream_id: 4,
            error_code: 1,
        });
        assert!(update_simple_frame_on_packet_clone(&conn, &frame).is_none());
    }

    #[test]
    fn clone_never_copies_path_response() {
        let conn = QuicConnectionState::new(QuicNodeType::Client);
        let frame = SimpleFrame::PathResponse(PathResponseFrame { path_data: 7 });
        assert!(update_simple_frame_on_packet_clone(&conn, &frame).is_none());
    }

    #[test]
    fn clone_keeps_matching_path_challenge_only() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let challenge = PathChallengeFrame { path_data: 7 };
        let frame = SimpleFrame::PathChallenge(challenge);
        assert!(update_simple_frame_on_packet_clone(&conn, &frame).is_none());
        conn.outstanding_path_validation = Some(challenge);
        assert!(update_simple_frame_on_packet_clone(&conn, &frame).is_some());
        conn.outstanding_path_validation = Some(PathChallengeFrame { path_data: 8 });
        assert!(update_simple_frame_on_packet_clone(&conn, &frame).is_none());
    }

    #[test]
    fn loss_requeues_stop_sending_for_live_stream() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.streams.create_stream(4);
        let frame = SimpleFrame::StopSending(StopSendingFrame {
            stream_id: 4,
            error_code: 1,
        });
        update_simple_frame_on_packet_loss(&mut conn, &frame);
        assert_eq!(conn.pending_events.frames, vec![frame.clone()]);

        // A vanished stream suppresses the retransmit.
        conn.pending_events.frames.clear();
        conn.streams.remove_stream(4);
        update_simple_frame_on_packet_loss(&mut conn, &frame);
        assert!(conn.pending_events.frames.is_empty());
    }

    #[test]
    fn loss_requeues_max_streams() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let frame = SimpleFrame::MaxStreams(MaxStreamsFrame {
            max_streams: 10,
            is_for_bidirectional: true,
        });
        update_simple_frame_on_packet_loss(&mut conn, &frame);
        assert_eq!(conn.pending_events.frames, vec![frame]);
    }

    #[test]
    fn loss_requeues_only_outstanding_path_challenge() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let challenge = PathChallengeFrame { path_data: 1 };
        update_simple_frame_on_packet_loss(&mut conn, &SimpleFrame::PathChallenge(challenge));
        assert!(conn.pending_events.path_challenge.is_none());

        conn.outstanding_path_validation = Some(challenge);
        update_simple_frame_on_packet_loss(&mut conn, &SimpleFrame::PathChallenge(challenge));
        assert_eq!(conn.pending_events.path_challenge, Some(challenge));
    }

    #[test]
    fn recv_path_challenge_rotates_and_enqueues_response() {
        let mut conn = conn_with_peer_ids(2);
        let retransmittable = update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::PathChallenge(PathChallengeFrame { path_data: 0x1234 }),
            1,
            true,
            Instant::now(),
        )
        .unwrap();
        assert!(!retransmittable);
        // Rotated to a spare id and queued the echo plus the retirement.
        assert_eq!(conn.server_connection_id, Some(cid(&[1, 1, 1, 1])));
        assert!(conn.pending_events.frames.iter().any(|frame| matches!(
            frame,
            SimpleFrame::PathResponse(response) if response.path_data == 0x1234
        )));
    }

    #[test]
    fn recv_path_challenge_without_spare_id_is_invalid_migration() {
        let mut conn = conn_with_peer_ids(0);
        let err = update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::PathChallenge(PathChallengeFrame { path_data: 1 }),
            1,
            true,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::InvalidMigration)
        );
    }

    #[test]
    fn recv_path_response_clears_outstanding_validation() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let challenge = PathChallengeFrame { path_data: 9 };
        conn.outstanding_path_validation = Some(challenge);
        conn.pending_events.schedule_path_validation_timeout = true;
        conn.path_challenge_start_time = Some(Instant::now());
        let retransmittable = update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::PathResponse(PathResponseFrame { path_data: 9 }),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        assert!(!retransmittable);
        assert!(conn.outstanding_path_validation.is_none());
        assert!(!conn.pending_events.schedule_path_validation_timeout);
        // The round trip fed the RTT estimator.
        assert_ne!(conn.rtt_state.mrtt, core::time::Duration::MAX);
    }

    #[test]
    fn recv_path_response_from_changed_address_is_ignored() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let challenge = PathChallengeFrame { path_data: 9 };
        conn.outstanding_path_validation = Some(challenge);
        update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::PathResponse(PathResponseFrame { path_data: 9 }),
            1,
            true,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(conn.outstanding_path_validation, Some(challenge));
    }

    #[test]
    fn recv_path_response_with_wrong_data_is_ignored() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        conn.outstanding_path_validation = Some(PathChallengeFrame { path_data: 9 });
        update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::PathResponse(PathResponseFrame { path_data: 10 }),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        assert!(conn.outstanding_path_validation.is_some());
    }

    fn new_cid_frame(seq: u64, retire_prior_to: u64, id: &[u8]) -> SimpleFrame {
        SimpleFrame::NewConnectionId(NewConnectionIdFrame {
            sequence_number: seq,
            retire_prior_to,
            connection_id: cid(id),
            token: [0; 16],
        })
    }

    #[test]
    fn recv_new_connection_id_appends() {
        let mut conn = conn_with_peer_ids(0);
        conn.transport_settings.self_active_connection_id_limit = 4;
        update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(1, 0, &[5, 5, 5, 5]),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(conn.peer_connection_ids.len(), 2);
    }

    #[test]
    fn recv_new_connection_id_bad_retire_prior_to() {
        let mut conn = conn_with_peer_ids(0);
        let err = update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(2, 3, &[5, 5, 5, 5]),
            1,
            false,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::ProtocolViolation)
        );
    }

    #[test]
    fn recv_new_connection_id_duplicate_semantics() {
        let mut conn = conn_with_peer_ids(0);
        conn.transport_settings.self_active_connection_id_limit = 4;
        update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(1, 0, &[5, 5, 5, 5]),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        // Exact duplicate: ignored.
        update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(1, 0, &[5, 5, 5, 5]),
            2,
            false,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(conn.peer_connection_ids.len(), 2);
        // Same id, new sequence: violation.
        let err = update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(2, 0, &[5, 5, 5, 5]),
            3,
            false,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::ProtocolViolation)
        );
    }

    #[test]
    fn recv_new_connection_id_respects_limit() {
        let mut conn = conn_with_peer_ids(0);
        conn.transport_settings.self_active_connection_id_limit = 1;
        update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(1, 0, &[5, 5, 5, 5]),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        // Set is at limit + 1 entries; further ids are dropped silently.
        update_simple_frame_on_packet_received(
            &mut conn,
            &new_cid_frame(2, 0, &[6, 6, 6, 6]),
            2,
            false,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(conn.peer_connection_ids.len(), 2);
    }

    #[test]
    fn recv_max_streams_updates_limits() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let retransmittable = update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::MaxStreams(MaxStreamsFrame {
                max_streams: 256,
                is_for_bidirectional: false,
            }),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        assert!(retransmittable);
        assert_eq!(conn.streams.max_local_unidirectional_streams(), 256);
    }

    #[test]
    fn recv_retire_connection_id_not_retransmittable() {
        let mut conn = QuicConnectionState::new(QuicNodeType::Client);
        let retransmittable = update_simple_frame_on_packet_received(
            &mut conn,
            &SimpleFrame::RetireConnectionId(RetireConnectionIdFrame { sequence_number: 0 }),
            1,
            false,
            Instant::now(),
        )
        .unwrap();
        assert!(!retransmittable);
    }
}
