//! Outbound packet assembly.
//!
//! [`RegularPacketBuilder`] owns two byte sinks, header and body, and a
//! running space budget. Long-header length and packet-number fields are
//! deferred until [`RegularPacketBuilder::build`], when the payload size is
//! known. The builder is consumed by finalization so partially-built state
//! cannot reach the wire.

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::frames::types::{FrameType, WriteFrame};
use crate::packet::header::{HeaderForm, LongHeader, LongHeaderType, PacketHeader, ProtectionType, ShortHeader};
use crate::packet::number::{encode_packet_number, PacketNumEncodingResult};
use crate::packet::{RegularWritePacket, VersionNegotiationPacket};
use crate::types::{
    encode_connection_id_lengths, ConnectionId, PacketNum, QuicInteger, QuicVersion,
    StatelessResetToken, DEFAULT_UDP_SEND_PACKET_LEN, HEADER_FORM_MASK, MAX_PACKET_LEN_SIZE,
    MAX_PACKET_NUM_ENCODING_SIZE, SAMPLE_LENGTH, VERSION_FIELD_SIZE,
};

/// Byte-sink interface shared by the regular builder and budget wrappers.
/// Frame writers target this trait so they can be reused on the clone path.
pub trait PacketBuilder {
    fn remaining_space_in_pkt(&self) -> u32;

    // Byte writes into the packet body; each decrements the budget.
    fn write_u8(&mut self, data: u8);
    fn write_u16(&mut self, data: u16);
    fn write_u64(&mut self, data: u64);
    fn write_integer(&mut self, value: QuicInteger);
    fn append_packet_num(&mut self, value: PacketNum, byte_number: u8);
    fn insert(&mut self, buf: Bytes);
    fn push(&mut self, data: &[u8]);

    /// Records a frame for bookkeeping. Emits no bytes; the caller is
    /// responsible for the wire form.
    fn append_frame(&mut self, frame: WriteFrame);

    fn packet_header(&self) -> &PacketHeader;

    fn version(&self) -> QuicVersion {
        QuicVersion::QUIC_V1
    }
}

/// Finalized output: bookkeeping packet plus header and body bytes. The body
/// is plaintext; the AEAD and header protection run downstream.
#[derive(Debug)]
pub struct BuiltPacket {
    pub packet: RegularWritePacket,
    pub header: Bytes,
    pub body: Bytes,
}

pub struct RegularPacketBuilder {
    remaining_bytes: u32,
    packet: RegularWritePacket,
    header: BytesMut,
    body: BytesMut,
    cipher_overhead: u32,
    packet_number_encoding: Option<PacketNumEncodingResult>,
    version: QuicVersion,
}

impl RegularPacketBuilder {
    /// Creates a builder and immediately encodes the header prefix,
    /// charging its cost (including the reserved length and packet-number
    /// room for long headers) against `remaining_bytes`.
    pub fn new(
        remaining_bytes: u32,
        header: PacketHeader,
        largest_acked_packet_num: PacketNum,
        version: QuicVersion,
    ) -> Self {
        let mut builder = Self {
            remaining_bytes,
            packet: RegularWritePacket::new(header),
            header: BytesMut::with_capacity(64),
            body: BytesMut::with_capacity(128),
            cipher_overhead: 0,
            packet_number_encoding: None,
            version,
        };
        builder.write_header_bytes(largest_acked_packet_num);
        builder
    }

    /// Estimated header byte count. Exact for short headers; for long
    /// headers the deferred length and packet-number fields are added to
    /// what has been written so far.
    pub fn header_bytes(&self) -> u32 {
        let encoding = self
            .packet_number_encoding
            .as_ref()
            .expect("packet number encoding is set by the constructor");
        let deferred = match self.packet.header.header_form() {
            HeaderForm::Long => encoding.length + MAX_PACKET_LEN_SIZE,
            HeaderForm::Short => 0,
        };
        self.header.len() as u32 + deferred as u32
    }

    /// Whether any budget remains. Check right after construction: a header
    /// that exceeded the budget clamps the budget to zero.
    pub fn can_build_packet(&self) -> bool {
        self.remaining_bytes != 0
    }

    pub fn set_cipher_overhead(&mut self, overhead: u8) {
        self.cipher_overhead = u32::from(overhead);
    }

    /// Finalizes the packet. Pads the body up to the header-protection
    /// sample minimum, then fills in the long-header length and packet
    /// number.
    pub fn build(mut self) -> BuiltPacket {
        let encoding = self
            .packet_number_encoding
            .expect("packet number encoding is set by the constructor");
        let min_body_size = MAX_PACKET_NUM_ENCODING_SIZE - encoding.length + SAMPLE_LENGTH;
        let body_length = self.body.len();
        let mut extra_data_written = 0usize;
        while body_length + extra_data_written + (self.cipher_overhead as usize) < min_body_size
            && !self.packet.frames.is_empty()
            && (self.remaining_bytes as usize) > MAX_PACKET_LEN_SIZE
        {
            // Padding frames are written but not recorded.
            let padding = QuicInteger::new(FrameType::Padding as u64).expect("fits");
            self.write_integer(padding);
            extra_data_written += 1;
        }

        let is_long = matches!(self.packet.header.header_form(), HeaderForm::Long);
        let is_retry = self
            .packet
            .header
            .as_long()
            .map(|h| h.header_type() == LongHeaderType::Retry)
            .unwrap_or(false);
        if is_long && !is_retry {
            let pkt_len = QuicInteger::new(
                (encoding.length + self.body.len() + self.cipher_overhead as usize) as u64,
            )
            .expect("packet length fits varint");
            pkt_len.encode(&mut self.header);
            append_packet_num_to(&mut self.header, encoding.result, encoding.length as u8);
        }

        BuiltPacket {
            packet: self.packet,
            header: self.header.freeze(),
            body: self.body.freeze(),
        }
    }

    fn write_header_bytes(&mut self, largest_acked_packet_num: PacketNum) {
        match &self.packet.header {
            PacketHeader::Long(_) => self.encode_long_header(largest_acked_packet_num),
            PacketHeader::Short(_) => self.encode_short_header(largest_acked_packet_num),
        }
    }

    fn encode_long_header(&mut self, largest_acked_packet_num: PacketNum) {
        let PacketHeader::Long(long_header) = self.packet.header.clone() else {
            unreachable!("caller checked the header form");
        };
        let encoding =
            encode_packet_number(long_header.packet_sequence_num(), largest_acked_packet_num);

        let mut initial_byte = HEADER_FORM_MASK
            | LongHeader::FIXED_BIT_MASK
            | ((long_header.header_type() as u8) << LongHeader::TYPE_SHIFT);
        initial_byte &= !LongHeader::RESERVED_BITS_MASK;
        initial_byte |= (encoding.length - 1) as u8;

        if long_header.header_type() == LongHeaderType::Retry {
            initial_byte &= 0xf0;
            let odcid_size = long_header
                .original_dst_conn_id()
                .map(|cid| cid.len())
                .unwrap_or(0);
            initial_byte |= if odcid_size == 0 {
                0
            } else {
                (odcid_size - 3) as u8
            };
        }

        self.header.put_u8(initial_byte);

        let is_initial = long_header.header_type() == LongHeaderType::Initial;
        let token = long_header.token().clone();
        let mut token_header_length = 0usize;
        if is_initial {
            let token_length_int =
                QuicInteger::new(token.len() as u64).expect("token length fits varint");
            token_header_length = token_length_int.size() + token.len();
        }

        // Charge the whole header up front: initial byte, version, cid
        // length prefixes and cids, Initial token, the reserved length
        // field, and the packet number.
        let cid_fields = if self.version.uses_packed_cid_lengths() {
            1 + long_header.destination_conn_id().len() + long_header.source_conn_id().len()
        } else {
            1 + long_header.destination_conn_id().len() + 1 + long_header.source_conn_id().len()
        };
        let long_header_size = 1
            + VERSION_FIELD_SIZE
            + cid_fields
            + token_header_length
            + MAX_PACKET_LEN_SIZE
            + encoding.length;
        if (self.remaining_bytes as usize) < long_header_size {
            self.remaining_bytes = 0;
        } else {
            self.remaining_bytes -= long_header_size as u32;
        }

        self.header.put_u32(long_header.version().0);
        if self.version.uses_packed_cid_lengths() {
            let packed = encode_connection_id_lengths(
                long_header.destination_conn_id().len() as u8,
                long_header.source_conn_id().len() as u8,
            );
            self.header.put_u8(packed);
            self.header
                .put_slice(long_header.destination_conn_id().as_slice());
            self.header.put_slice(long_header.source_conn_id().as_slice());
        } else {
            self.header
                .put_u8(long_header.destination_conn_id().len() as u8);
            self.header
                .put_slice(long_header.destination_conn_id().as_slice());
            self.header.put_u8(long_header.source_conn_id().len() as u8);
            self.header.put_slice(long_header.source_conn_id().as_slice());
        }

        if is_initial {
            let token_length_int =
                QuicInteger::new(token.len() as u64).expect("token length fits varint");
            token_length_int.encode(&mut self.header);
            if !token.is_empty() {
                self.header.put_slice(&token);
            }
        }

        if long_header.header_type() == LongHeaderType::Retry {
            let odcid = long_header
                .original_dst_conn_id()
                .expect("retry header carries the original destination cid");
            self.header.put_u8(odcid.len() as u8);
            self.header.put_slice(odcid.as_slice());
            debug_assert!(!token.is_empty(), "retry packet must contain a token");
            self.header.put_slice(&token);
        }

        // The packet number and length are written at build time.
        self.packet_number_encoding = Some(encoding);
    }

    fn encode_short_header(&mut self, largest_acked_packet_num: PacketNum) {
        let PacketHeader::Short(short_header) = self.packet.header.clone() else {
            unreachable!("caller checked the header form");
        };
        let encoding =
            encode_packet_number(short_header.packet_sequence_num(), largest_acked_packet_num);
        self.packet_number_encoding = Some(encoding);

        if (self.remaining_bytes as usize) < 1 + encoding.length + short_header.connection_id().len()
        {
            self.remaining_bytes = 0;
            return;
        }

        let mut initial_byte = ShortHeader::FIXED_BIT_MASK | (encoding.length - 1) as u8;
        initial_byte &= !ShortHeader::RESERVED_BITS_MASK;
        if short_header.protection_type() == ProtectionType::KeyPhaseOne {
            initial_byte |= ShortHeader::KEY_PHASE_MASK;
        }
        self.header.put_u8(initial_byte);
        self.remaining_bytes -= 1;

        self.header.put_slice(short_header.connection_id().as_slice());
        self.remaining_bytes -= short_header.connection_id().len() as u32;

        append_packet_num_to(&mut self.header, encoding.result, encoding.length as u8);
        self.remaining_bytes -= encoding.length as u32;
    }
}

fn append_packet_num_to<B: BufMut>(buf: &mut B, value: PacketNum, byte_number: u8) {
    let be = value.to_be_bytes();
    buf.put_slice(&be[be.len() - usize::from(byte_number)..]);
}

impl PacketBuilder for RegularPacketBuilder {
    fn remaining_space_in_pkt(&self) -> u32 {
        self.remaining_bytes
    }

    fn write_u8(&mut self, data: u8) {
        self.body.put_u8(data);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(1);
    }

    fn write_u16(&mut self, data: u16) {
        self.body.put_u16(data);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(2);
    }

    fn write_u64(&mut self, data: u64) {
        self.body.put_u64(data);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(8);
    }

    fn write_integer(&mut self, value: QuicInteger) {
        let written = value.encode(&mut self.body);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(written as u32);
    }

    fn append_packet_num(&mut self, value: PacketNum, byte_number: u8) {
        append_packet_num_to(&mut self.body, value, byte_number);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(u32::from(byte_number));
    }

    fn insert(&mut self, buf: Bytes) {
        self.remaining_bytes = self.remaining_bytes.saturating_sub(buf.len() as u32);
        self.body.put_slice(&buf);
    }

    fn push(&mut self, data: &[u8]) {
        self.body.put_slice(data);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(data.len() as u32);
    }

    fn append_frame(&mut self, frame: WriteFrame) {
        self.packet.frames.push(frame);
    }

    fn packet_header(&self) -> &PacketHeader {
        &self.packet.header
    }

    fn version(&self) -> QuicVersion {
        self.version
    }
}

/// Wraps another builder with a smaller writable-bytes limit; the minimum of
/// the two budgets applies.
pub struct PacketBuilderWrapper<'a, B: PacketBuilder> {
    builder: &'a mut B,
    diff: u32,
}

impl<'a, B: PacketBuilder> PacketBuilderWrapper<'a, B> {
    pub fn new(builder: &'a mut B, writable_bytes: u32) -> Self {
        let diff = if writable_bytes > builder.remaining_space_in_pkt() {
            0
        } else {
            builder.remaining_space_in_pkt() - writable_bytes
        };
        Self { builder, diff }
    }
}

impl<B: PacketBuilder> PacketBuilder for PacketBuilderWrapper<'_, B> {
    fn remaining_space_in_pkt(&self) -> u32 {
        self.builder.remaining_space_in_pkt().saturating_sub(self.diff)
    }

    fn write_u8(&mut self, data: u8) {
        self.builder.write_u8(data);
    }

    fn write_u16(&mut self, data: u16) {
        self.builder.write_u16(data);
    }

    fn write_u64(&mut self, data: u64) {
        self.builder.write_u64(data);
    }

    fn write_integer(&mut self, value: QuicInteger) {
        self.builder.write_integer(value);
    }

    fn append_packet_num(&mut self, value: PacketNum, byte_number: u8) {
        self.builder.append_packet_num(value, byte_number);
    }

    fn insert(&mut self, buf: Bytes) {
        self.builder.insert(buf);
    }

    fn push(&mut self, data: &[u8]) {
        self.builder.push(data);
    }

    fn append_frame(&mut self, frame: WriteFrame) {
        self.builder.append_frame(frame);
    }

    fn packet_header(&self) -> &PacketHeader {
        self.builder.packet_header()
    }

    fn version(&self) -> QuicVersion {
        self.builder.version()
    }
}

/// Emits the unprotected stateless-reset shape: fixed bit, secure-random
/// filler, then the 16-byte token.
pub struct StatelessResetPacketBuilder {
    data: BytesMut,
}

impl StatelessResetPacketBuilder {
    pub fn new(max_packet_size: u16, reset_token: &StatelessResetToken) -> Self {
        let mut data = BytesMut::with_capacity(usize::from(max_packet_size));
        let random_octet_length =
            usize::from(max_packet_size) - reset_token.len() - 1;
        data.put_u8(ShortHeader::FIXED_BIT_MASK);
        let mut random_octets = vec![0u8; random_octet_length];
        OsRng.fill_bytes(&mut random_octets);
        data.put_slice(&random_octets);
        data.put_slice(reset_token);
        Self { data }
    }

    pub fn build(self) -> Bytes {
        self.data.freeze()
    }
}

/// Emits the version-negotiation packet shape.
pub struct VersionNegotiationPacketBuilder {
    remaining_bytes: u32,
    packet: VersionNegotiationPacket,
    data: BytesMut,
}

impl VersionNegotiationPacketBuilder {
    pub fn new(
        source_connection_id: ConnectionId,
        destination_connection_id: ConnectionId,
        versions: &[QuicVersion],
    ) -> Self {
        let mut builder = Self {
            remaining_bytes: DEFAULT_UDP_SEND_PACKET_LEN as u32,
            packet: VersionNegotiationPacket {
                packet_type: Self::generate_random_packet_type(),
                source_connection_id,
                destination_connection_id,
                versions: Vec::new(),
            },
            data: BytesMut::with_capacity(128),
        };
        builder.write_version_negotiation_packet(versions);
        builder
    }

    pub fn remaining_space_in_pkt(&self) -> u32 {
        self.remaining_bytes
    }

    pub fn can_build_packet(&self) -> bool {
        self.remaining_bytes != 0
    }

    pub fn build(self) -> (VersionNegotiationPacket, Bytes) {
        (self.packet, self.data.freeze())
    }

    fn write_version_negotiation_packet(&mut self, versions: &[QuicVersion]) {
        self.data.put_u8(self.packet.packet_type);
        self.remaining_bytes -= 1;
        self.data.put_u32(QuicVersion::VERSION_NEGOTIATION.0);
        self.remaining_bytes -= VERSION_FIELD_SIZE as u32;
        self.data
            .put_u8(self.packet.destination_connection_id.len() as u8);
        self.remaining_bytes -= 1;
        self.data
            .put_slice(self.packet.destination_connection_id.as_slice());
        self.remaining_bytes -= self.packet.destination_connection_id.len() as u32;
        self.data.put_u8(self.packet.source_connection_id.len() as u8);
        self.remaining_bytes -= 1;
        self.data
            .put_slice(self.packet.source_connection_id.as_slice());
        self.remaining_bytes -= self.packet.source_connection_id.len() as u32;
        for version in versions {
            if self.remaining_bytes < VERSION_FIELD_SIZE as u32 {
                break;
            }
            self.data.put_u32(version.0);
            self.remaining_bytes -= VERSION_FIELD_SIZE as u32;
            self.packet.versions.push(*version);
        }
    }

    fn generate_random_packet_type() -> u8 {
        // Fixed type byte: peers deployed before the type byte was made
        // greaseable reject anything else here. Do not switch this to a
        // random value without re-validating against those deployments.
        HEADER_FORM_MASK
    }
}
