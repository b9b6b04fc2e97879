//! # velo-quic: QUIC wire codec and connection transmission core
//!
//! A reliable, multiplexed, encrypted datagram transport atop UDP, per:
//!
//! - **RFC 8999**: Version-Independent Properties of QUIC
//! - **RFC 9000**: QUIC: A UDP-Based Multiplexed and Secure Transport
//! - **RFC 9001**: Using TLS to Secure QUIC
//!
//! This crate is the wire codec and the per-connection transmission state
//! machine: packet and frame serialization and parsing, the packet builder
//! and PTO-path rebuilder, pacing, outbound datagram batching, and the
//! simple-frame lifecycle governing flow control, path validation, the
//! connection-id lifecycle and stream limits.
//!
//! ## Architecture
//!
//! ```text
//! velo-quic/
//! ├── types       - ConnectionId, varints, packet numbers, versions
//! ├── error       - transport / application / local error taxonomy
//! ├── frames      - frame model, strict-pull parser, frame writers
//! ├── packet      - headers, packet number codec, builders, rebuilder
//! ├── connection  - connection state, streams, simple frames, rate limit
//! ├── pacing      - token-bucket pacer with timer-drift compensation
//! ├── batch       - outbound datagram coalescing (GSO / sendmmsg)
//! ├── crypto      - opaque AEAD + header-protection seams
//! ├── qlog        - structured event log (qlog JSON schema)
//! └── stats       - best-effort transport counters
//! ```
//!
//! ## Design
//!
//! 1. **Single-threaded per connection.** All connection state is owned by
//!    one reactor thread; nothing here locks. Helpers take
//!    `&mut QuicConnectionState` and never store a reference.
//!
//! 2. **Synchronous core.** Every operation runs to completion inside one
//!    event callback. Timers and I/O readiness surface as pending events
//!    the outer loop drains.
//!
//! 3. **Consumed builders.** A packet builder is finalized by value, so a
//!    partially-built packet cannot leak to the wire.
//!
//! 4. **No crypto primitives.** The codec consumes an opaque AEAD and
//!    header-protection interface; see [`crypto`].
//!
//! The TLS handshake engine, loss-detection timers, congestion-control
//! algorithms and the UDP event loop are external collaborators.

#![deny(unsafe_code)]

pub mod batch;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frames;
pub mod packet;
pub mod pacing;
pub mod qlog;
pub mod settings;
pub mod stats;
pub mod types;

pub use connection::{
    send_simple_frame, update_simple_frame_on_ack, update_simple_frame_on_packet_clone,
    update_simple_frame_on_packet_loss, update_simple_frame_on_packet_received,
    update_simple_frame_on_packet_sent, OutstandingPacket, PacketEvent, PendingEvents,
    QuicConnectionState, StreamManager, StreamState,
};
pub use error::{
    ApplicationErrorCode, LocalErrorCode, QuicError, QuicErrorCode, QuicResult,
    TransportErrorCode,
};
pub use frames::{ReadFrame, SimpleFrame, WriteFrame};
pub use packet::{
    BuiltPacket, PacketBuilder, PacketHeader, PacketRebuilder, RegularPacket,
    RegularPacketBuilder, RegularWritePacket, StatelessResetPacketBuilder,
    VersionNegotiationPacket, VersionNegotiationPacketBuilder,
};
pub use pacing::{calculate_pacing_rate, Pacer, PacingRateCalculator};
pub use settings::{PacingRate, QuicBatchingMode, TransportSettings};
pub use types::{
    ConnectionId, ConnectionIdData, PacketNum, PacketNumberSpace, QuicNodeType, QuicVersion,
    StatelessResetToken, StreamId,
};
