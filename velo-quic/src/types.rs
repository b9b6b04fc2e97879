//! # Core wire types (RFC 8999, RFC 9000)
//!
//! Fundamental value types shared by the codec and the connection state
//! machine: connection IDs, packet numbers, stream IDs, versions and the
//! variable-length integer encoding.

use bytes::{Buf, BufMut};
use core::time::Duration;

use crate::error::{LocalErrorCode, QuicError};

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Maximum value representable as a QUIC variable-length integer (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

pub const ONE_BYTE_LIMIT: u64 = 0x3f;
pub const TWO_BYTE_LIMIT: u64 = 0x3fff;
pub const FOUR_BYTE_LIMIT: u64 = 0x3fff_ffff;
pub const EIGHT_BYTE_LIMIT: u64 = 0x3fff_ffff_ffff_ffff;

/// A value validated to fit the variable-length encoding.
///
/// Wraps the raw integer so that size computation and encoding cannot fail
/// after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicInteger(u64);

impl QuicInteger {
    /// Validates the value against [`VARINT_MAX`].
    pub fn new(value: u64) -> Result<Self, QuicError> {
        if value > VARINT_MAX {
            return Err(QuicError::local(
                LocalErrorCode::CodecError,
                "value too large for QUIC integer",
            ));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Number of bytes of the minimal encoding.
    pub fn size(&self) -> usize {
        if self.0 <= ONE_BYTE_LIMIT {
            1
        } else if self.0 <= TWO_BYTE_LIMIT {
            2
        } else if self.0 <= FOUR_BYTE_LIMIT {
            4
        } else {
            8
        }
    }

    /// Writes the minimal encoding, returning the bytes written.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> usize {
        match self.size() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16((self.0 as u16) | 0x4000),
            4 => buf.put_u32((self.0 as u32) | 0x8000_0000),
            _ => buf.put_u64(self.0 | 0xc000_0000_0000_0000),
        }
        self.size()
    }
}

/// Returns the encoded size for `value`, failing if it exceeds [`VARINT_MAX`].
pub fn quic_integer_size(value: u64) -> Result<usize, QuicError> {
    QuicInteger::new(value).map(|i| i.size())
}

/// Strict-pull decode. Returns `(value, bytes_consumed)`, or `None` when the
/// buffer does not hold the full encoding. The buffer is only advanced on
/// success.
pub fn decode_quic_integer<B: Buf>(buf: &mut B) -> Option<(u64, usize)> {
    if !buf.has_remaining() {
        return None;
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
    };
    Some((value, len))
}

/// Length of a QUIC integer given its first byte.
pub fn decode_quic_integer_length(first_byte: u8) -> usize {
    1usize << (first_byte >> 6)
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum connection-id length on the wire.
pub const MAX_CONNECTION_ID_SIZE: usize = 20;

/// Minimum length required for the destination connection-id on inbound
/// initial packets.
pub const MIN_INITIAL_DESTINATION_CONN_ID_LENGTH: usize = 8;

/// An opaque endpoint-chosen identifier of 0..=20 bytes.
///
/// Stored inline; no heap allocation. Equality and hashing cover only the
/// used prefix.
#[derive(Clone, Copy)]
pub struct ConnectionId {
    bytes: [u8; MAX_CONNECTION_ID_SIZE],
    len: u8,
}

impl ConnectionId {
    /// Creates a connection-id, failing when the input exceeds the wire cap.
    pub fn new(data: &[u8]) -> Result<Self, QuicError> {
        if data.len() > MAX_CONNECTION_ID_SIZE {
            return Err(QuicError::local(
                LocalErrorCode::ConnectionIdInvalidSize,
                "connection id invalid size",
            ));
        }
        let mut bytes = [0u8; MAX_CONNECTION_ID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    /// Pulls `len` bytes out of a wire buffer.
    pub fn from_buf<B: Buf>(buf: &mut B, len: usize) -> Result<Self, QuicError> {
        if len > MAX_CONNECTION_ID_SIZE {
            return Err(QuicError::local(
                LocalErrorCode::ConnectionIdInvalidSize,
                "connection id invalid size",
            ));
        }
        if buf.remaining() < len {
            return Err(QuicError::local(
                LocalErrorCode::ConnectionIdInvalidSize,
                "not enough input for connection id",
            ));
        }
        let mut bytes = [0u8; MAX_CONNECTION_ID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            bytes,
            len: len as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hex(&self) -> String {
        self.as_slice().iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ConnectionId {}

impl core::hash::Hash for ConnectionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(fnv32(self.as_slice()));
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({})", self.hex())
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// FNV-1a 32-bit over the used prefix.
pub fn fnv32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Decodes the packed cid-length byte used by the legacy long-header form.
/// Returns `(dcid_len, scid_len)`.
pub fn decode_connection_id_lengths(packed: u8) -> (u8, u8) {
    let dcid = packed >> 4;
    let scid = packed & 0x0f;
    (
        if dcid == 0 { 0 } else { dcid + 3 },
        if scid == 0 { 0 } else { scid + 3 },
    )
}

/// Packs two cid lengths into the legacy single-byte form: `0 -> 0`,
/// `n -> n - 3` per nibble.
pub fn encode_connection_id_lengths(dcid_len: u8, scid_len: u8) -> u8 {
    debug_assert!(usize::from(dcid_len) <= MAX_CONNECTION_ID_SIZE);
    debug_assert!(usize::from(scid_len) <= MAX_CONNECTION_ID_SIZE);
    let dst = if dcid_len == 0 { 0 } else { dcid_len - 3 };
    let src = if scid_len == 0 { 0 } else { scid_len - 3 };
    (dst << 4) | src
}

/// A peer-supplied connection-id with its sequence number and reset token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdData {
    pub conn_id: ConnectionId,
    pub sequence_number: u64,
    pub token: Option<StatelessResetToken>,
}

impl ConnectionIdData {
    pub fn new(
        conn_id: ConnectionId,
        sequence_number: u64,
        token: Option<StatelessResetToken>,
    ) -> Self {
        Self {
            conn_id,
            sequence_number,
            token,
        }
    }
}

// ============================================================================
// Stateless reset token
// ============================================================================

pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

pub type StatelessResetToken = [u8; STATELESS_RESET_TOKEN_LENGTH];

// ============================================================================
// Packet numbers and spaces (RFC 9000 Section 12.3)
// ============================================================================

pub type PacketNum = u64;

/// The three independent packet-number sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    AppData,
}

impl PacketNumberSpace {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketNumberSpace::Initial => "InitialSpace",
            PacketNumberSpace::Handshake => "HandshakeSpace",
            PacketNumberSpace::AppData => "AppDataSpace",
        }
    }
}

/// Longest truncated packet-number encoding on the wire.
pub const MAX_PACKET_NUM_ENCODING_SIZE: usize = 4;

// ============================================================================
// Stream IDs (RFC 9000 Section 2.1)
// ============================================================================

pub type StreamId = u64;

/// Which endpoint this connection state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicNodeType {
    Client,
    Server,
}

pub fn is_client_stream(id: StreamId) -> bool {
    id & 0x01 == 0
}

pub fn is_server_stream(id: StreamId) -> bool {
    id & 0x01 == 1
}

pub fn is_bidirectional_stream(id: StreamId) -> bool {
    id & 0x02 == 0
}

pub fn is_unidirectional_stream(id: StreamId) -> bool {
    id & 0x02 != 0
}

/// A unidirectional stream we only receive on, or the peer's half we never
/// send on.
pub fn is_receiving_stream(node_type: QuicNodeType, id: StreamId) -> bool {
    is_unidirectional_stream(id)
        && match node_type {
            QuicNodeType::Client => is_server_stream(id),
            QuicNodeType::Server => is_client_stream(id),
        }
}

pub fn is_sending_stream(node_type: QuicNodeType, id: StreamId) -> bool {
    is_unidirectional_stream(id)
        && match node_type {
            QuicNodeType::Client => is_client_stream(id),
            QuicNodeType::Server => is_server_stream(id),
        }
}

// ============================================================================
// Versions (RFC 8999 Section 5.2)
// ============================================================================

/// A QUIC version tag. `MVFST_OLD` is the single supported legacy version;
/// its only on-wire difference is the packed cid-length byte in the long
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuicVersion(pub u32);

impl QuicVersion {
    pub const VERSION_NEGOTIATION: QuicVersion = QuicVersion(0x0000_0000);
    pub const QUIC_V1: QuicVersion = QuicVersion(0x0000_0001);
    pub const MVFST_OLD: QuicVersion = QuicVersion(0xface_b000);

    /// Whether the long header packs both cid lengths into one byte.
    pub fn uses_packed_cid_lengths(self) -> bool {
        self == Self::MVFST_OLD
    }
}

pub type QuicVersionType = u32;

// ============================================================================
// Protocol constants
// ============================================================================

/// Wire size of a version field.
pub const VERSION_FIELD_SIZE: usize = core::mem::size_of::<QuicVersionType>();

/// Reserved room for the long-header length field (two-byte varint).
pub const MAX_PACKET_LEN_SIZE: usize = 2;

/// Header-protection sample length; also the ballpark AEAD overhead used when
/// sizing writes before the cipher is known.
pub const SAMPLE_LENGTH: usize = 16;
pub const CIPHER_OVERHEAD_HEURISTIC: usize = 16;

/// First-byte header-form bit, common to both header forms.
pub const HEADER_FORM_MASK: u8 = 0x80;

/// Default UDP send size before PMTU discovery.
pub const DEFAULT_UDP_SEND_PACKET_LEN: usize = 1200;

/// Per-write packet burst when pacing is off or app-limited.
pub const DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT: u64 = 5;

/// Smallest pacing burst the rate calculator will produce.
pub const DEFAULT_MIN_BURST_PACKETS: u64 = 5;

/// Granularity of the pacing timer; RTTs below this disable pacing.
pub const DEFAULT_PACING_TIMER_TICK_INTERVAL: Duration = Duration::from_millis(10);

pub const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;

pub const MIN_CWND_IN_MSS: u64 = 2;
pub const INIT_CWND_IN_MSS: u64 = 10;
pub const DEFAULT_MAX_CWND_IN_MSS: u64 = 2000;

/// Largest number of datagrams one batched send may carry.
pub const DEFAULT_QUIC_MAX_BATCH_SIZE: u32 = 16;

pub const DEFAULT_CONNECTION_WINDOW_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_STREAM_WINDOW_SIZE: u64 = 64 * 1024;
pub const DEFAULT_MAX_STREAMS_BIDIRECTIONAL: u64 = 100;
pub const DEFAULT_MAX_STREAMS_UNIDIRECTIONAL: u64 = 100;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip_minimal_lengths() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (63, 1),
            (64, 2),
            (16383, 2),
            (16384, 4),
            ((1 << 30) - 1, 4),
            (1 << 30, 8),
            (VARINT_MAX, 8),
        ];
        for &(value, expected_len) in cases {
            let int = QuicInteger::new(value).unwrap();
            assert_eq!(int.size(), expected_len, "size for {value}");
            let mut buf = Vec::new();
            assert_eq!(int.encode(&mut buf), expected_len);
            assert_eq!(buf.len(), expected_len);
            let mut cursor = &buf[..];
            let (decoded, consumed) = decode_quic_integer(&mut cursor).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, expected_len);
        }
    }

    #[test]
    fn varint_rejects_oversized_value() {
        assert!(QuicInteger::new(VARINT_MAX + 1).is_err());
    }

    #[test]
    fn varint_decode_truncated_input() {
        // 2-byte encoding with only one byte present.
        let buf = [0x40u8];
        let mut cursor = &buf[..];
        assert!(decode_quic_integer(&mut cursor).is_none());
        // Cursor untouched on failure.
        assert_eq!(cursor.len(), 1);
    }

    #[test]
    fn connection_id_round_trip_all_lengths() {
        for len in 0..=MAX_CONNECTION_ID_SIZE {
            let data: Vec<u8> = (0..len as u8).collect();
            let cid = ConnectionId::new(&data).unwrap();
            assert_eq!(cid.as_slice(), &data[..]);
            let mut cursor = &data[..];
            let parsed = ConnectionId::from_buf(&mut cursor, len).unwrap();
            assert_eq!(parsed, cid);
        }
    }

    #[test]
    fn connection_id_too_long() {
        let data = [0u8; MAX_CONNECTION_ID_SIZE + 1];
        assert!(ConnectionId::new(&data).is_err());
    }

    #[test]
    fn connection_id_equality_is_length_and_content() {
        let a = ConnectionId::new(&[1, 2, 3]).unwrap();
        let b = ConnectionId::new(&[1, 2, 3, 0]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn packed_cid_lengths_round_trip() {
        // The packed nibble form covers length 0 and lengths 4..=18.
        for dcid in [0u8, 4, 8, 17, 18] {
            for scid in [0u8, 4, 8, 18] {
                let packed = encode_connection_id_lengths(dcid, scid);
                assert_eq!(decode_connection_id_lengths(packed), (dcid, scid));
            }
        }
    }

    #[test]
    fn connection_id_hex() {
        let cid = ConnectionId::new(&[0xab, 0xcd]).unwrap();
        assert_eq!(cid.hex(), "abcd");
    }
}
