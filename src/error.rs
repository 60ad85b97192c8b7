//! Error handling for the IEC 60870-5-104 client
//!
//! A single crate-level error enum carrying a discriminant per failure class.
//! Framing and ASDU errors are local (the offending frame is dropped, the
//! session stays up); `SequenceError`, `T1Timeout` and `Disconnected` are
//! fatal to the session and tear the connection down.

use thiserror::Error;

/// IEC 60870-5-104 client error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Iec104Error {
    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// TCP connect did not complete within t0
    #[error("Connect timed out: {0}")]
    ConnectTimeout(String),

    /// Peer refused the TCP connection
    #[error("Connection refused: {0}")]
    ConnectRefused(String),

    /// Peer closed the connection or the socket died
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Socket write failed
    #[error("Write error: {0}")]
    WriteError(String),

    /// Socket read failed
    #[error("Read error: {0}")]
    ReadError(String),

    /// No complete frame arrived within the receive deadline
    #[error("Read timed out: {0}")]
    ReadTimeout(String),

    // ------------------------------------------------------------------
    // Framing (APCI)
    // ------------------------------------------------------------------
    /// First octet was not 0x68
    #[error("Bad start byte: {0:#04x}")]
    BadStartByte(u8),

    /// APDU length outside 4..=253
    #[error("Bad APDU length: {0}")]
    BadLength(u8),

    /// Fewer bytes than the APCI header declares
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Control field matches neither I, S nor U format
    #[error("Unknown frame format: control octet {0:#04x}")]
    UnknownFormat(u8),

    /// S-frame with non-canonical first control octets
    #[error("Malformed S-frame")]
    MalformedSFrame,

    /// U-frame function octet is not one of the six defined functions
    #[error("Unknown U-frame function: {0:#04x}")]
    UnknownUFunction(u8),

    // ------------------------------------------------------------------
    // ASDU
    // ------------------------------------------------------------------
    /// Type identification not supported by this client
    #[error("Unsupported type identification: {0}")]
    UnsupportedType(u8),

    /// Cause of transmission outside the defined range
    #[error("Bad cause of transmission: {0}")]
    BadCot(u8),

    /// Common address outside 1..=65534
    #[error("Bad common address: {0}")]
    BadCommonAddress(u16),

    /// Information object address outside 1..=16777215
    #[error("Bad information object address: {0}")]
    BadIoa(u32),

    /// VSQ element count outside 1..=127
    #[error("Bad element count: {0}")]
    BadElementCount(u8),

    /// An information object would read past the ASDU bounds
    #[error("Partial information object at index {0}")]
    PartialInfoObject(usize),

    /// A value's runtime variant does not fit the chosen TypeID
    #[error("Value type mismatch for type identification {0}")]
    ValueTypeMismatch(u8),

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------
    /// Data transfer is not active (no STARTDT confirmation)
    #[error("Data transfer not active")]
    NotActive,

    /// k unacknowledged I-frames already outstanding
    #[error("Send window full")]
    WindowFull,

    /// Sequence-number violation from the peer
    #[error("Sequence error: {0}")]
    SequenceError(String),

    /// t1 elapsed with an APDU still unacknowledged
    #[error("t1 timeout: {0}")]
    T1Timeout(String),

    /// U-frame confirmation received with no matching request pending
    #[error("Unexpected U-frame: {0}")]
    UnexpectedUFrame(String),

    /// Peer confirmed a command with the negative bit set
    #[error("Command rejected by peer: {0}")]
    CommandRejected(String),

    // ------------------------------------------------------------------
    // API
    // ------------------------------------------------------------------
    /// Tag address string failed to parse or is out of range
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No tag registered under that name
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Write attempted on a monitoring-direction tag
    #[error("Tag is read-only: {0}")]
    TagReadOnly(String),

    /// No session exists (or none is active) for the tag's endpoint
    #[error("No session: {0}")]
    NoSession(String),

    /// No value has been cached yet, or the session is down
    #[error("Stale value: {0}")]
    Stale(String),

    /// Configuration rejected before any connection was attempted
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for the IEC 60870-5-104 client
pub type Result<T> = std::result::Result<T, Iec104Error>;

impl Iec104Error {
    /// True for errors that tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Iec104Error::SequenceError(_)
                | Iec104Error::T1Timeout(_)
                | Iec104Error::Disconnected(_)
        )
    }

    /// Short machine-readable discriminant for structured log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectRefused(_) => "connect_refused",
            Self::Disconnected(_) => "disconnected",
            Self::WriteError(_) => "write_error",
            Self::ReadError(_) => "read_error",
            Self::ReadTimeout(_) => "read_timeout",
            Self::BadStartByte(_) => "bad_start_byte",
            Self::BadLength(_) => "bad_length",
            Self::Truncated { .. } => "truncated",
            Self::UnknownFormat(_) => "unknown_format",
            Self::MalformedSFrame => "malformed_s_frame",
            Self::UnknownUFunction(_) => "unknown_u_function",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::BadCot(_) => "bad_cot",
            Self::BadCommonAddress(_) => "bad_common_address",
            Self::BadIoa(_) => "bad_ioa",
            Self::BadElementCount(_) => "bad_element_count",
            Self::PartialInfoObject(_) => "partial_info_object",
            Self::ValueTypeMismatch(_) => "value_type_mismatch",
            Self::NotActive => "not_active",
            Self::WindowFull => "window_full",
            Self::SequenceError(_) => "sequence_error",
            Self::T1Timeout(_) => "t1_timeout",
            Self::UnexpectedUFrame(_) => "unexpected_u_frame",
            Self::CommandRejected(_) => "command_rejected",
            Self::InvalidAddress(_) => "invalid_address",
            Self::TagNotFound(_) => "tag_not_found",
            Self::TagReadOnly(_) => "tag_read_only",
            Self::NoSession(_) => "no_session",
            Self::Stale(_) => "stale",
            Self::ConfigError(_) => "config_error",
        }
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Iec104Error::Disconnected(msg.into())
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Iec104Error::SequenceError(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Iec104Error::ConfigError(msg.into())
    }
}

impl From<std::io::Error> for Iec104Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Iec104Error::ConnectRefused(err.to_string()),
            ErrorKind::TimedOut => Iec104Error::ConnectTimeout(err.to_string()),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Iec104Error::Disconnected(err.to_string()),
            _ => Iec104Error::ReadError(err.to_string()),
        }
    }
}
