//! Minimal stream manager: per-stream send state, retransmission buffers and
//! the partial-reliability offset bookkeeping.
//!
//! Buffering of application writes and reassembly of reads belong to the full
//! stream layer; the transmission core only needs what the rebuilder and the
//! simple-frame processor consult.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

use crate::error::{ApplicationErrorCode, QuicError, QuicResult, TransportErrorCode};
use crate::frames::types::{
    ExpiredStreamDataFrame, MaxStreamDataFrame, MinStreamDataFrame, SimpleFrame, StopSendingFrame,
    WriteStreamFrame,
};
use crate::types::{is_receiving_stream, is_sending_stream, QuicNodeType, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSendState {
    Open,
    ResetSent,
    Closed,
}

/// One contiguous chunk awaiting acknowledgment, keyed by its original send
/// offset. A chunk trimmed by partial reliability keeps its original key so
/// acks still find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pub data: Bytes,
    pub offset: u64,
    pub eof: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StreamFlowControlState {
    pub window_size: u64,
    /// Largest receive offset we have advertised to the peer.
    pub advertised_max_offset: u64,
    /// Largest send offset the peer has advertised to us.
    pub peer_advertised_max_offset: u64,
}

#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: StreamId,
    pub send_state: StreamSendState,
    pub current_write_offset: u64,
    pub current_read_offset: u64,
    /// Partial reliability: lowest offset the peer may still deliver.
    pub current_receive_offset: u64,
    /// Partial reliability: lowest offset we are still obliged to retransmit.
    pub minimum_retransmittable_offset: u64,
    pub final_read_offset: Option<u64>,
    pub final_write_offset: Option<u64>,
    pub retransmission_buffer: BTreeMap<u64, StreamBuffer>,
    pub flow_control: StreamFlowControlState,
    /// Peer asked us to stop sending with this code.
    pub stop_sending_error: Option<ApplicationErrorCode>,
    /// Set when the receive window moved enough to warrant an update.
    pub flow_control_update_wanted: bool,
}

impl StreamState {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            send_state: StreamSendState::Open,
            current_write_offset: 0,
            current_read_offset: 0,
            current_receive_offset: 0,
            minimum_retransmittable_offset: 0,
            final_read_offset: None,
            final_write_offset: None,
            retransmission_buffer: BTreeMap::new(),
            flow_control: StreamFlowControlState::default(),
            stop_sending_error: None,
            flow_control_update_wanted: false,
        }
    }

    /// Whether lost data on this stream must be resent.
    pub fn retransmittable(&self) -> bool {
        matches!(self.send_state, StreamSendState::Open)
    }

    pub fn should_send_flow_control(&self) -> bool {
        self.flow_control_update_wanted
    }

    /// A fresh MAX_STREAM_DATA limit derived from current receive state.
    pub fn generate_max_stream_data(&self) -> MaxStreamDataFrame {
        MaxStreamDataFrame {
            stream_id: self.id,
            maximum_data: self
                .flow_control
                .advertised_max_offset
                .max(self.current_read_offset + self.flow_control.window_size),
        }
    }

    /// A MIN_STREAM_DATA announcement for the current receive offset.
    pub fn generate_min_stream_data(&self) -> MinStreamDataFrame {
        MinStreamDataFrame {
            stream_id: self.id,
            maximum_data: self.generate_max_stream_data().maximum_data,
            minimum_stream_offset: self.current_receive_offset,
        }
    }

    pub fn insert_into_retransmission_buffer(&mut self, offset: u64, data: Bytes, eof: bool) {
        self.retransmission_buffer
            .insert(offset, StreamBuffer { data, offset, eof });
    }
}

/// Whether a previously-sent stream frame still matches its retransmission
/// buffer entry. Conservative: offset, length and FIN must match exactly, so
/// a buffer truncated by a received MIN_STREAM_DATA never matches.
pub fn stream_frame_matches_retransmit_buffer(
    frame: &WriteStreamFrame,
    buffer: &StreamBuffer,
) -> bool {
    buffer.offset == frame.offset && buffer.data.len() as u64 == frame.len && buffer.eof == frame.fin
}

#[derive(Debug, Default)]
pub struct StreamManager {
    streams: HashMap<StreamId, StreamState>,
    max_local_bidirectional_streams: u64,
    max_local_unidirectional_streams: u64,
    /// Streams the peer sent STOP_SENDING for, awaiting application action.
    stop_sending_streams: Vec<(StreamId, ApplicationErrorCode)>,
    /// Streams whose send data was skipped by a received MIN_STREAM_DATA.
    data_rejected_streams: Vec<StreamId>,
    /// Streams whose receive data expired via EXPIRED_STREAM_DATA.
    data_expired_streams: Vec<StreamId>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_exists(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn get_stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn get_stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn create_stream(&mut self, id: StreamId) -> &mut StreamState {
        self.streams.entry(id).or_insert_with(|| StreamState::new(id))
    }

    pub fn remove_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    pub fn max_local_bidirectional_streams(&self) -> u64 {
        self.max_local_bidirectional_streams
    }

    pub fn max_local_unidirectional_streams(&self) -> u64 {
        self.max_local_unidirectional_streams
    }

    pub fn set_max_local_bidirectional_streams(&mut self, max_streams: u64) {
        self.max_local_bidirectional_streams = max_streams;
    }

    pub fn set_max_local_unidirectional_streams(&mut self, max_streams: u64) {
        self.max_local_unidirectional_streams = max_streams;
    }

    pub fn add_data_rejected(&mut self, id: StreamId) {
        self.data_rejected_streams.push(id);
    }

    pub fn add_data_expired(&mut self, id: StreamId) {
        self.data_expired_streams.push(id);
    }

    pub fn consume_data_rejected(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.data_rejected_streams)
    }

    pub fn consume_data_expired(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.data_expired_streams)
    }

    pub fn consume_stop_sending(&mut self) -> Vec<(StreamId, ApplicationErrorCode)> {
        std::mem::take(&mut self.stop_sending_streams)
    }

    /// Receive-side STOP_SENDING handler: record the request for the
    /// application while the stream is still writable.
    pub fn on_stop_sending(&mut self, id: StreamId, frame: &StopSendingFrame) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.retransmittable() {
                stream.stop_sending_error = Some(frame.error_code);
                self.stop_sending_streams.push((id, frame.error_code));
            }
        }
    }
}

// ============================================================================
// Partial-reliability offset bookkeeping
// ============================================================================

/// Drops buffered chunks entirely below `offset` and trims the one that
/// straddles it, keeping its original key.
fn shrink_retransmission_buffer(stream: &mut StreamState, offset: u64) {
    let mut remove = Vec::new();
    for (key, buffer) in stream.retransmission_buffer.iter_mut() {
        if buffer.offset >= offset {
            continue;
        }
        let end = buffer.offset + buffer.data.len() as u64;
        if end <= offset {
            remove.push(*key);
        } else {
            let amount = (offset - buffer.offset) as usize;
            buffer.data = buffer.data.slice(amount..);
            buffer.offset = offset;
        }
    }
    for key in remove {
        stream.retransmission_buffer.remove(&key);
    }
}

/// Advances the receive offset after loss of a MIN_STREAM_DATA carrier or on
/// application request, and (re)queues the announcement to the peer.
pub fn advance_current_receive_offset(
    stream: &mut StreamState,
    offset: u64,
    pending_frames: &mut Vec<SimpleFrame>,
) -> Option<u64> {
    if offset <= stream.current_receive_offset || offset <= stream.current_read_offset {
        return None;
    }
    let mut offset = offset;
    if let Some(final_read_offset) = stream.final_read_offset {
        offset = offset.min(final_read_offset);
    }
    stream.current_receive_offset = offset;
    stream.current_read_offset = offset;

    let frame = stream.generate_min_stream_data();
    let existing = pending_frames.iter_mut().find_map(|pending| match pending {
        SimpleFrame::MinStreamData(min) if min.stream_id == stream.id => Some(min),
        _ => None,
    });
    match existing {
        Some(min) => *min = frame,
        None => pending_frames.push(SimpleFrame::MinStreamData(frame)),
    }
    Some(offset)
}

/// Advances the lowest offset this sender will retransmit and (re)queues the
/// EXPIRED_STREAM_DATA announcement.
pub fn advance_minimum_retransmittable_offset(
    stream: &mut StreamState,
    minimum_stream_offset: u64,
    pending_frames: &mut Vec<SimpleFrame>,
) -> Option<u64> {
    if minimum_stream_offset <= stream.minimum_retransmittable_offset {
        return None;
    }
    let mut minimum_stream_offset =
        minimum_stream_offset.min(stream.flow_control.peer_advertised_max_offset);
    if let Some(final_write_offset) = stream.final_write_offset {
        minimum_stream_offset = minimum_stream_offset.min(final_write_offset);
    }
    if minimum_stream_offset <= stream.minimum_retransmittable_offset {
        return None;
    }
    stream.minimum_retransmittable_offset = minimum_stream_offset;
    shrink_retransmission_buffer(stream, minimum_stream_offset);

    let existing = pending_frames.iter_mut().find_map(|pending| match pending {
        SimpleFrame::ExpiredStreamData(expired) if expired.stream_id == stream.id => Some(expired),
        _ => None,
    });
    match existing {
        Some(expired) => expired.minimum_stream_offset = minimum_stream_offset,
        None => pending_frames.push(SimpleFrame::ExpiredStreamData(ExpiredStreamDataFrame {
            stream_id: stream.id,
            minimum_stream_offset,
        })),
    }
    Some(minimum_stream_offset)
}

impl StreamManager {
    /// Receipt of MIN_STREAM_DATA: the peer gave up on data below the given
    /// offset; stop retransmitting it and take the window update.
    pub fn on_recv_min_stream_data(
        &mut self,
        node_type: QuicNodeType,
        frame: &MinStreamDataFrame,
        _packet_num: u64,
        pending_frames: &mut Vec<SimpleFrame>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&frame.stream_id) else {
            return Ok(());
        };
        if is_receiving_stream(node_type, stream.id)
            || (is_sending_stream(node_type, stream.id)
                && stream.send_state != StreamSendState::Open)
        {
            return Err(QuicError::transport(
                TransportErrorCode::ProtocolViolation,
                "MIN_STREAM_DATA on receiving-only or unopened sending stream",
            ));
        }
        if frame.maximum_data < frame.minimum_stream_offset {
            return Err(QuicError::transport(
                TransportErrorCode::FrameEncodingError,
                "MIN_STREAM_DATA maximum below minimum offset",
            ));
        }
        if frame.minimum_stream_offset <= stream.minimum_retransmittable_offset {
            return Ok(());
        }

        stream.flow_control.peer_advertised_max_offset = stream
            .flow_control
            .peer_advertised_max_offset
            .max(frame.maximum_data);

        let mut minimum_stream_offset = frame.minimum_stream_offset;
        if let Some(final_write_offset) = stream.final_write_offset {
            minimum_stream_offset = minimum_stream_offset.min(final_write_offset);
        }
        stream.minimum_retransmittable_offset = minimum_stream_offset;
        if minimum_stream_offset > stream.current_write_offset {
            stream.current_write_offset = minimum_stream_offset;
        }
        shrink_retransmission_buffer(stream, minimum_stream_offset);

        // A pending EXPIRED_STREAM_DATA at or below the new floor is stale.
        let floor = stream.minimum_retransmittable_offset;
        if let Some(pos) = pending_frames.iter().position(|pending| {
            matches!(pending, SimpleFrame::ExpiredStreamData(expired)
                if expired.minimum_stream_offset <= floor)
        }) {
            pending_frames.remove(pos);
        }
        self.data_rejected_streams.push(frame.stream_id);
        Ok(())
    }

    /// Receipt of EXPIRED_STREAM_DATA: the sender will not retransmit below
    /// the given offset; skip ahead.
    pub fn on_recv_expired_stream_data(
        &mut self,
        node_type: QuicNodeType,
        frame: &ExpiredStreamDataFrame,
        pending_frames: &mut Vec<SimpleFrame>,
    ) -> QuicResult<()> {
        let Some(stream) = self.streams.get_mut(&frame.stream_id) else {
            return Ok(());
        };
        if is_sending_stream(node_type, stream.id) {
            return Err(QuicError::transport(
                TransportErrorCode::ProtocolViolation,
                "EXPIRED_STREAM_DATA on unidirectional sending stream",
            ));
        }
        // Frames that do not advance the offset are loss/reordering noise.
        if frame.minimum_stream_offset <= stream.current_receive_offset
            || frame.minimum_stream_offset <= stream.current_read_offset
        {
            return Ok(());
        }
        let mut minimum_stream_offset = frame.minimum_stream_offset;
        if let Some(final_read_offset) = stream.final_read_offset {
            minimum_stream_offset = minimum_stream_offset.min(final_read_offset);
        }
        stream.current_receive_offset = minimum_stream_offset;
        stream.current_read_offset = minimum_stream_offset;

        // A pending MIN_STREAM_DATA at or below the new offset is stale.
        let floor = stream.current_receive_offset;
        if let Some(pos) = pending_frames.iter().position(|pending| {
            matches!(pending, SimpleFrame::MinStreamData(min)
                if min.minimum_stream_offset <= floor)
        }) {
            pending_frames.remove(pos);
        }
        self.data_expired_streams.push(frame.stream_id);
        Ok(())
    }
}
