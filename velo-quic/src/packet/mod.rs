//! Packet model: headers, number encoding, the packet builders and the
//! PTO-path rebuilder.

pub mod builder;
pub mod header;
pub mod number;
pub mod rebuilder;

use smallvec::SmallVec;

use crate::frames::types::{ReadFrame, WriteFrame};
use crate::types::{ConnectionId, QuicVersion};

pub use builder::{
    BuiltPacket, PacketBuilder, PacketBuilderWrapper, RegularPacketBuilder,
    StatelessResetPacketBuilder, VersionNegotiationPacketBuilder,
};
pub use header::{
    header_form, parse_long_header, parse_short_header, parse_version_negotiation_packet,
    HeaderForm, LongHeader, LongHeaderType, PacketHeader, ParsedLongHeader, ParsedShortHeader,
    ProtectionType, ShortHeader,
};
pub use number::{decode_packet_number, encode_packet_number, PacketNumEncodingResult};
pub use rebuilder::PacketRebuilder;

/// A regular (non-special) packet read from the network, after decryption.
#[derive(Debug, Clone)]
pub struct RegularPacket {
    pub header: PacketHeader,
    pub frames: SmallVec<[ReadFrame; 4]>,
}

impl RegularPacket {
    pub fn new(header: PacketHeader) -> Self {
        Self {
            header,
            frames: SmallVec::new(),
        }
    }
}

/// A regular packet as written to the network. Frames carry bookkeeping
/// only; the wire bytes live in the builder output.
#[derive(Debug, Clone)]
pub struct RegularWritePacket {
    pub header: PacketHeader,
    pub frames: SmallVec<[WriteFrame; 4]>,
}

impl RegularWritePacket {
    pub fn new(header: PacketHeader) -> Self {
        Self {
            header,
            frames: SmallVec::new(),
        }
    }
}

/// The special unprotected packet advertising supported versions.
#[derive(Debug, Clone)]
pub struct VersionNegotiationPacket {
    pub packet_type: u8,
    pub source_connection_id: ConnectionId,
    pub destination_connection_id: ConnectionId,
    pub versions: Vec<QuicVersion>,
}
