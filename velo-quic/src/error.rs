//! Error taxonomy: wire-visible transport error codes, opaque application
//! error codes, and host-side local error codes that never reach the wire.

use thiserror::Error;

/// Transport error codes per RFC 9000 Section 20, with the draft-era
/// INVALID_MIGRATION retained for the path-validation handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    #[error("no error")]
    NoError,

    #[error("internal error")]
    InternalError,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("flow control error")]
    FlowControlError,

    #[error("stream limit error")]
    StreamLimitError,

    #[error("stream state error")]
    StreamStateError,

    #[error("final size error")]
    FinalSizeError,

    #[error("frame encoding error")]
    FrameEncodingError,

    #[error("transport parameter error")]
    TransportParameterError,

    #[error("connection ID limit error")]
    ConnectionIdLimitError,

    #[error("protocol violation")]
    ProtocolViolation,

    #[error("invalid token")]
    InvalidToken,

    #[error("application error")]
    ApplicationError,

    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    #[error("key update error")]
    KeyUpdateError,

    #[error("AEAD limit reached")]
    AeadLimitReached,

    #[error("no viable path")]
    NoViablePath,

    /// Extension code; not part of the RFC 9000 registry block.
    #[error("invalid migration")]
    InvalidMigration,

    #[error("crypto error: {0:#x}")]
    Crypto(u16),
}

impl TransportErrorCode {
    /// Wire representation carried in CONNECTION_CLOSE.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ConnectionIdLimitError => 0x09,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidToken => 0x0b,
            TransportErrorCode::ApplicationError => 0x0c,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::KeyUpdateError => 0x0e,
            TransportErrorCode::AeadLimitReached => 0x0f,
            TransportErrorCode::NoViablePath => 0x10,
            TransportErrorCode::InvalidMigration => 0x12,
            TransportErrorCode::Crypto(code) => 0x0100 + u64::from(code),
        }
    }

    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x09 => TransportErrorCode::ConnectionIdLimitError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0b => TransportErrorCode::InvalidToken,
            0x0c => TransportErrorCode::ApplicationError,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            0x0e => TransportErrorCode::KeyUpdateError,
            0x0f => TransportErrorCode::AeadLimitReached,
            0x10 => TransportErrorCode::NoViablePath,
            0x12 => TransportErrorCode::InvalidMigration,
            0x0100..=0x01ff => TransportErrorCode::Crypto((code - 0x0100) as u16),
            _ => TransportErrorCode::InternalError,
        }
    }
}

/// Opaque 62-bit value carried in CONNECTION_CLOSE_APP_ERR and RST_STREAM.
pub type ApplicationErrorCode = u64;

/// Host-side error conditions. Never serialized.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorCode {
    #[error("internal error")]
    InternalError,

    #[error("codec error")]
    CodecError,

    #[error("connection id invalid size")]
    ConnectionIdInvalidSize,

    #[error("stream not exists")]
    StreamNotExists,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("packet number encoding failure")]
    PacketNumberEncoding,
}

/// Either side of the error split carried by a CONNECTION_CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicErrorCode {
    Transport(TransportErrorCode),
    Application(ApplicationErrorCode),
}

impl QuicErrorCode {
    pub fn to_wire(self) -> u64 {
        match self {
            QuicErrorCode::Transport(code) => code.to_wire(),
            QuicErrorCode::Application(code) => code,
        }
    }

    pub fn as_transport(&self) -> Option<TransportErrorCode> {
        match self {
            QuicErrorCode::Transport(code) => Some(*code),
            QuicErrorCode::Application(_) => None,
        }
    }
}

impl core::fmt::Display for QuicErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QuicErrorCode::Transport(code) => write!(f, "{code}"),
            QuicErrorCode::Application(code) => write!(f, "application error {code:#x}"),
        }
    }
}

/// The error type raised by the codec and the connection state machine.
///
/// Transport errors propagate to the connection, which closes with the
/// corresponding wire code; local errors stay on the host.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuicError {
    #[error("{code}: {reason}")]
    Transport {
        code: TransportErrorCode,
        reason: &'static str,
    },

    #[error("{code}: {reason}")]
    Local {
        code: LocalErrorCode,
        reason: &'static str,
    },
}

impl QuicError {
    pub fn transport(code: TransportErrorCode, reason: &'static str) -> Self {
        QuicError::Transport { code, reason }
    }

    pub fn local(code: LocalErrorCode, reason: &'static str) -> Self {
        QuicError::Local { code, reason }
    }

    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            QuicError::Transport { code, .. } => Some(*code),
            QuicError::Local { .. } => None,
        }
    }
}

pub type QuicResult<T> = Result<T, QuicError>;
