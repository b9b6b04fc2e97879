//! Packet header model (RFC 9000 Section 17).
//!
//! Long headers carry both connection-ids and the version and are used during
//! the handshake; short headers carry only the destination cid and the key
//! phase. The first byte is a bitfield; reserved bits are zero until header
//! protection is applied.

use bytes::{Buf, Bytes};

use crate::error::{QuicError, QuicResult, TransportErrorCode};
use crate::types::{
    decode_connection_id_lengths, decode_quic_integer, ConnectionId, PacketNum, PacketNumberSpace,
    QuicVersion, HEADER_FORM_MASK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Long,
    Short,
}

/// Returns the header form encoded in the first byte. Version invariant.
pub fn header_form(first_byte: u8) -> HeaderForm {
    if first_byte & HEADER_FORM_MASK != 0 {
        HeaderForm::Long
    } else {
        HeaderForm::Short
    }
}

/// How the packet payload is protected. For short headers only the key-phase
/// bit is visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionType {
    Initial,
    Handshake,
    ZeroRtt,
    KeyPhaseZero,
    KeyPhaseOne,
}

impl ProtectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtectionType::Initial => "Initial",
            ProtectionType::Handshake => "Handshake",
            ProtectionType::ZeroRtt => "ZeroRtt",
            ProtectionType::KeyPhaseZero => "KeyPhaseZero",
            ProtectionType::KeyPhaseOne => "KeyPhaseOne",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial = 0x0,
    ZeroRtt = 0x1,
    Handshake = 0x2,
    Retry = 0x3,
}

impl LongHeaderType {
    pub fn from_type_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0x0 => LongHeaderType::Initial,
            0x1 => LongHeaderType::ZeroRtt,
            0x2 => LongHeaderType::Handshake,
            _ => LongHeaderType::Retry,
        }
    }

    pub fn packet_number_space(self) -> PacketNumberSpace {
        match self {
            LongHeaderType::Initial | LongHeaderType::Retry => PacketNumberSpace::Initial,
            LongHeaderType::Handshake => PacketNumberSpace::Handshake,
            LongHeaderType::ZeroRtt => PacketNumberSpace::AppData,
        }
    }

    pub fn protection_type(self) -> ProtectionType {
        match self {
            LongHeaderType::Initial | LongHeaderType::Retry => ProtectionType::Initial,
            LongHeaderType::Handshake => ProtectionType::Handshake,
            LongHeaderType::ZeroRtt => ProtectionType::ZeroRtt,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LongHeaderType::Initial => "Initial",
            LongHeaderType::ZeroRtt => "ZeroRtt",
            LongHeaderType::Handshake => "Handshake",
            LongHeaderType::Retry => "Retry",
        }
    }
}

/// The version-invariant prefix of a long header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeaderInvariant {
    pub version: QuicVersion,
    pub src_conn_id: ConnectionId,
    pub dst_conn_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    header_type: LongHeaderType,
    invariant: LongHeaderInvariant,
    packet_sequence_num: PacketNum,
    /// Initial token or Retry token body; empty when absent.
    token: Bytes,
    /// Retry only.
    original_dst_conn_id: Option<ConnectionId>,
}

impl LongHeader {
    pub const FIXED_BIT_MASK: u8 = 0x40;
    pub const PACKET_TYPE_MASK: u8 = 0x30;
    pub const RESERVED_BITS_MASK: u8 = 0x0c;
    pub const PACKET_NUM_LEN_MASK: u8 = 0x03;
    pub const TYPE_SHIFT: u8 = 4;

    pub fn new(
        header_type: LongHeaderType,
        src_conn_id: ConnectionId,
        dst_conn_id: ConnectionId,
        packet_sequence_num: PacketNum,
        version: QuicVersion,
    ) -> Self {
        Self {
            header_type,
            invariant: LongHeaderInvariant {
                version,
                src_conn_id,
                dst_conn_id,
            },
            packet_sequence_num,
            token: Bytes::new(),
            original_dst_conn_id: None,
        }
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = token;
        self
    }

    pub fn with_original_dst_conn_id(mut self, odcid: ConnectionId) -> Self {
        self.original_dst_conn_id = Some(odcid);
        self
    }

    pub fn header_type(&self) -> LongHeaderType {
        self.header_type
    }

    pub fn source_conn_id(&self) -> &ConnectionId {
        &self.invariant.src_conn_id
    }

    pub fn destination_conn_id(&self) -> &ConnectionId {
        &self.invariant.dst_conn_id
    }

    pub fn original_dst_conn_id(&self) -> Option<&ConnectionId> {
        self.original_dst_conn_id.as_ref()
    }

    pub fn version(&self) -> QuicVersion {
        self.invariant.version
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    pub fn packet_sequence_num(&self) -> PacketNum {
        self.packet_sequence_num
    }

    pub fn set_packet_number(&mut self, packet_num: PacketNum) {
        self.packet_sequence_num = packet_num;
    }

    pub fn packet_number_space(&self) -> PacketNumberSpace {
        self.header_type.packet_number_space()
    }

    pub fn protection_type(&self) -> ProtectionType {
        self.header_type.protection_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    protection_type: ProtectionType,
    connection_id: ConnectionId,
    packet_sequence_num: PacketNum,
}

impl ShortHeader {
    // There is also a spin bit at 0x20 that we do not implement.
    pub const FIXED_BIT_MASK: u8 = 0x40;
    pub const RESERVED_BITS_MASK: u8 = 0x18;
    pub const KEY_PHASE_MASK: u8 = 0x04;
    pub const PACKET_NUM_LEN_MASK: u8 = 0x03;

    /// `protection_type` must be one of the two key phases.
    pub fn new(
        protection_type: ProtectionType,
        connection_id: ConnectionId,
        packet_sequence_num: PacketNum,
    ) -> QuicResult<Self> {
        match protection_type {
            ProtectionType::KeyPhaseZero | ProtectionType::KeyPhaseOne => Ok(Self {
                protection_type,
                connection_id,
                packet_sequence_num,
            }),
            _ => Err(QuicError::transport(
                TransportErrorCode::InternalError,
                "short header must use a key-phase protection type",
            )),
        }
    }

    pub fn protection_type(&self) -> ProtectionType {
        self.protection_type
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn packet_sequence_num(&self) -> PacketNum {
        self.packet_sequence_num
    }

    pub fn set_packet_number(&mut self, packet_num: PacketNum) {
        self.packet_sequence_num = packet_num;
    }

    pub fn packet_number_space(&self) -> PacketNumberSpace {
        PacketNumberSpace::AppData
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    Long(LongHeader),
    Short(ShortHeader),
}

impl PacketHeader {
    pub fn header_form(&self) -> HeaderForm {
        match self {
            PacketHeader::Long(_) => HeaderForm::Long,
            PacketHeader::Short(_) => HeaderForm::Short,
        }
    }

    pub fn as_long(&self) -> Option<&LongHeader> {
        match self {
            PacketHeader::Long(header) => Some(header),
            PacketHeader::Short(_) => None,
        }
    }

    pub fn as_short(&self) -> Option<&ShortHeader> {
        match self {
            PacketHeader::Short(header) => Some(header),
            PacketHeader::Long(_) => None,
        }
    }

    pub fn packet_sequence_num(&self) -> PacketNum {
        match self {
            PacketHeader::Long(header) => header.packet_sequence_num(),
            PacketHeader::Short(header) => header.packet_sequence_num(),
        }
    }

    pub fn packet_number_space(&self) -> PacketNumberSpace {
        match self {
            PacketHeader::Long(header) => header.packet_number_space(),
            PacketHeader::Short(header) => header.packet_number_space(),
        }
    }

    pub fn protection_type(&self) -> ProtectionType {
        match self {
            PacketHeader::Long(header) => header.protection_type(),
            PacketHeader::Short(header) => header.protection_type(),
        }
    }
}

/// A long header as parsed before header-protection removal: the packet
/// number is not yet known, the length field covers pn + payload.
#[derive(Debug, Clone)]
pub struct ParsedLongHeader {
    pub header: LongHeader,
    /// Length field: packet number plus payload plus cipher overhead.
    pub payload_length: u64,
    /// Packet-number length bits from the (unprotected) first byte.
    pub packet_number_length: usize,
}

fn encoding_error(reason: &'static str) -> QuicError {
    QuicError::transport(TransportErrorCode::FrameEncodingError, reason)
}

/// Parses the unprotected version-negotiation packet: type byte, the zero
/// version, both length-prefixed cids, then the supported versions.
pub fn parse_version_negotiation_packet<B: Buf>(
    buf: &mut B,
) -> QuicResult<crate::packet::VersionNegotiationPacket> {
    if buf.remaining() < 5 {
        return Err(encoding_error("truncated version negotiation packet"));
    }
    let packet_type = buf.get_u8();
    if header_form(packet_type) != HeaderForm::Long {
        return Err(encoding_error("not a long header"));
    }
    let version = QuicVersion(buf.get_u32());
    if version != QuicVersion::VERSION_NEGOTIATION {
        return Err(encoding_error("unexpected version field"));
    }
    if !buf.has_remaining() {
        return Err(encoding_error("truncated cid length"));
    }
    let dcid_len = usize::from(buf.get_u8());
    let destination_connection_id = ConnectionId::from_buf(buf, dcid_len)
        .map_err(|_| encoding_error("bad destination cid"))?;
    if !buf.has_remaining() {
        return Err(encoding_error("truncated cid length"));
    }
    let scid_len = usize::from(buf.get_u8());
    let source_connection_id =
        ConnectionId::from_buf(buf, scid_len).map_err(|_| encoding_error("bad source cid"))?;
    let mut versions = Vec::new();
    while buf.remaining() >= 4 {
        versions.push(QuicVersion(buf.get_u32()));
    }
    if versions.is_empty() {
        return Err(encoding_error("version negotiation carries no versions"));
    }
    Ok(crate::packet::VersionNegotiationPacket {
        packet_type,
        source_connection_id,
        destination_connection_id,
        versions,
    })
}

/// Parses a long header off the front of `buf`. The first byte must already
/// have header protection removed for the packet-number length bits to be
/// meaningful; everything else is unprotected on the wire. A zero version
/// field belongs to [`parse_version_negotiation_packet`].
pub fn parse_long_header<B: Buf>(buf: &mut B) -> QuicResult<ParsedLongHeader> {
    if buf.remaining() < 5 {
        return Err(encoding_error("truncated long header"));
    }
    let first = buf.get_u8();
    if header_form(first) != HeaderForm::Long {
        return Err(encoding_error("not a long header"));
    }
    let version = QuicVersion(buf.get_u32());
    if version == QuicVersion::VERSION_NEGOTIATION {
        return Err(encoding_error("version negotiation is not a regular packet"));
    }
    let header_type =
        LongHeaderType::from_type_bits((first & LongHeader::PACKET_TYPE_MASK) >> LongHeader::TYPE_SHIFT);
    let pn_len = usize::from(first & LongHeader::PACKET_NUM_LEN_MASK) + 1;

    let (dst_conn_id, src_conn_id) = if version.uses_packed_cid_lengths() {
        if !buf.has_remaining() {
            return Err(encoding_error("truncated cid lengths"));
        }
        let (dcid_len, scid_len) = decode_connection_id_lengths(buf.get_u8());
        let dcid = ConnectionId::from_buf(buf, usize::from(dcid_len))
            .map_err(|_| encoding_error("truncated destination cid"))?;
        let scid = ConnectionId::from_buf(buf, usize::from(scid_len))
            .map_err(|_| encoding_error("truncated source cid"))?;
        (dcid, scid)
    } else {
        if !buf.has_remaining() {
            return Err(encoding_error("truncated cid length"));
        }
        let dcid_len = usize::from(buf.get_u8());
        let dcid = ConnectionId::from_buf(buf, dcid_len)
            .map_err(|_| encoding_error("bad destination cid"))?;
        if !buf.has_remaining() {
            return Err(encoding_error("truncated cid length"));
        }
        let scid_len = usize::from(buf.get_u8());
        let scid =
            ConnectionId::from_buf(buf, scid_len).map_err(|_| encoding_error("bad source cid"))?;
        (dcid, scid)
    };

    let mut header = LongHeader::new(header_type, src_conn_id, dst_conn_id, 0, version);

    if header_type == LongHeaderType::Initial {
        let (token_len, _) =
            decode_quic_integer(buf).ok_or_else(|| encoding_error("truncated token length"))?;
        if buf.remaining() < token_len as usize {
            return Err(encoding_error("truncated token"));
        }
        if token_len > 0 {
            header = header.with_token(buf.copy_to_bytes(token_len as usize));
        }
    }

    if header_type == LongHeaderType::Retry {
        if !buf.has_remaining() {
            return Err(encoding_error("truncated original dst cid length"));
        }
        let odcid_len = usize::from(buf.get_u8());
        let odcid = ConnectionId::from_buf(buf, odcid_len)
            .map_err(|_| encoding_error("bad original dst cid"))?;
        // The rest of the datagram is the retry token.
        let token = buf.copy_to_bytes(buf.remaining());
        if token.is_empty() {
            return Err(encoding_error("retry packet must contain a token"));
        }
        header = header.with_original_dst_conn_id(odcid).with_token(token);
        return Ok(ParsedLongHeader {
            header,
            payload_length: 0,
            packet_number_length: 0,
        });
    }

    let (payload_length, _) =
        decode_quic_integer(buf).ok_or_else(|| encoding_error("truncated length field"))?;

    Ok(ParsedLongHeader {
        header,
        payload_length,
        packet_number_length: pn_len,
    })
}

/// A short header as parsed before header-protection removal.
#[derive(Debug, Clone)]
pub struct ParsedShortHeader {
    pub header: ShortHeader,
    pub packet_number_length: usize,
}

/// Short-header parse requires knowing our own cid length; the wire carries
/// no length prefix.
pub fn parse_short_header<B: Buf>(buf: &mut B, dst_conn_id_len: usize) -> QuicResult<ParsedShortHeader> {
    if buf.remaining() < 1 + dst_conn_id_len {
        return Err(encoding_error("truncated short header"));
    }
    let first = buf.get_u8();
    if header_form(first) != HeaderForm::Short {
        return Err(encoding_error("not a short header"));
    }
    let connection_id = ConnectionId::from_buf(buf, dst_conn_id_len)
        .map_err(|_| encoding_error("bad destination cid"))?;
    let protection_type = if first & ShortHeader::KEY_PHASE_MASK != 0 {
        ProtectionType::KeyPhaseOne
    } else {
        ProtectionType::KeyPhaseZero
    };
    let pn_len = usize::from(first & ShortHeader::PACKET_NUM_LEN_MASK) + 1;
    Ok(ParsedShortHeader {
        header: ShortHeader::new(protection_type, connection_id, 0)?,
        packet_number_length: pn_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(data: &[u8]) -> ConnectionId {
        ConnectionId::new(data).unwrap()
    }

    #[test]
    fn header_form_from_first_byte() {
        assert_eq!(header_form(0xc3), HeaderForm::Long);
        assert_eq!(header_form(0x41), HeaderForm::Short);
    }

    #[test]
    fn long_header_type_spaces() {
        assert_eq!(
            LongHeaderType::Initial.packet_number_space(),
            PacketNumberSpace::Initial
        );
        assert_eq!(
            LongHeaderType::Handshake.packet_number_space(),
            PacketNumberSpace::Handshake
        );
        assert_eq!(
            LongHeaderType::ZeroRtt.packet_number_space(),
            PacketNumberSpace::AppData
        );
        assert_eq!(
            LongHeaderType::Retry.packet_number_space(),
            PacketNumberSpace::Initial
        );
    }

    #[test]
    fn short_header_rejects_long_protection() {
        let err = ShortHeader::new(ProtectionType::Initial, cid(&[1, 2]), 0);
        assert!(err.is_err());
    }

    #[test]
    fn parse_v1_long_header() {
        let mut wire = Vec::new();
        // Initial, pn length 2.
        wire.push(0xc0 | 0x01);
        wire.extend_from_slice(&QuicVersion::QUIC_V1.0.to_be_bytes());
        wire.push(4);
        wire.extend_from_slice(&[1, 2, 3, 4]);
        wire.push(2);
        wire.extend_from_slice(&[9, 9]);
        wire.push(0); // token length
        wire.push(0x2a); // length field, 1-byte varint
        let mut cursor = &wire[..];
        let parsed = parse_long_header(&mut cursor).unwrap();
        assert_eq!(parsed.header.header_type(), LongHeaderType::Initial);
        assert_eq!(parsed.header.destination_conn_id().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(parsed.header.source_conn_id().as_slice(), &[9, 9]);
        assert_eq!(parsed.payload_length, 0x2a);
        assert_eq!(parsed.packet_number_length, 2);
        assert!(!parsed.header.has_token());
    }

    #[test]
    fn parse_legacy_packed_cid_lengths() {
        let mut wire = Vec::new();
        wire.push(0xc0); // Initial, pn length 1
        wire.extend_from_slice(&QuicVersion::MVFST_OLD.0.to_be_bytes());
        // dcid 8 bytes -> code 5; scid 4 bytes -> code 1.
        wire.push((5 << 4) | 1);
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        wire.extend_from_slice(&[0xa, 0xb, 0xc, 0xd]);
        wire.push(0); // token length
        wire.push(0x10); // length field
        let mut cursor = &wire[..];
        let parsed = parse_long_header(&mut cursor).unwrap();
        assert_eq!(
            parsed.header.destination_conn_id().as_slice(),
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(
            parsed.header.source_conn_id().as_slice(),
            &[0xa, 0xb, 0xc, 0xd]
        );
    }

    #[test]
    fn version_negotiation_round_trip() {
        use crate::packet::builder::VersionNegotiationPacketBuilder;

        let builder = VersionNegotiationPacketBuilder::new(
            cid(&[2, 2, 2, 2]),
            cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            &[QuicVersion::QUIC_V1, QuicVersion::MVFST_OLD],
        );
        let (_, data) = builder.build();
        let mut cursor = &data[..];
        let parsed = parse_version_negotiation_packet(&mut cursor).unwrap();
        assert_eq!(
            parsed.destination_connection_id.as_slice(),
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(parsed.source_connection_id.as_slice(), &[2, 2, 2, 2]);
        assert_eq!(
            parsed.versions,
            vec![QuicVersion::QUIC_V1, QuicVersion::MVFST_OLD]
        );
    }

    #[test]
    fn regular_parse_rejects_version_negotiation() {
        let mut wire = Vec::new();
        wire.push(0xc0);
        wire.extend_from_slice(&[0, 0, 0, 0]);
        wire.push(0);
        wire.push(0);
        let mut cursor = &wire[..];
        assert!(parse_long_header(&mut cursor).is_err());
    }

    #[test]
    fn parse_short_header_key_phase() {
        let mut wire = Vec::new();
        wire.push(0x40 | ShortHeader::KEY_PHASE_MASK | 0x01);
        wire.extend_from_slice(&[7, 7, 7, 7]);
        wire.extend_from_slice(&[0, 0]); // pn bytes (opaque here)
        let mut cursor = &wire[..];
        let parsed = parse_short_header(&mut cursor, 4).unwrap();
        assert_eq!(
            parsed.header.protection_type(),
            ProtectionType::KeyPhaseOne
        );
        assert_eq!(parsed.header.connection_id().as_slice(), &[7, 7, 7, 7]);
        assert_eq!(parsed.packet_number_length, 2);
    }
}
