//! Error types for the protocol engine.
//!
//! Each error is attributable to one responder: a transport exchange, one
//! ECU's frames, or one command's payload.

use thiserror::Error;

use elm_protocol::ConnectionState;

/// Byte-layer failures: connect, send, receive, timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no reply after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport not connected")]
    NotConnected,

    #[error("transport closed by peer")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Convenience alias for transport results.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure to reassemble one ECU's frames. Siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameAssemblyError {
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    #[error("consecutive frame out of sequence: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("consecutive frame without a first frame")]
    UnexpectedConsecutive,

    #[error("truncated payload: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("first frame arrived while a message was still being assembled")]
    Superseded,
}

/// A command yielded no result for this cycle. Never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no data")]
    NoData,

    #[error("payload too short: need {expected} bytes, got {got}")]
    InsufficientLength { expected: usize, got: usize },

    #[error("no catalog entry for service 0x{service:02X} PID 0x{pid:X}")]
    Unmappable { service: u8, pid: u16 },

    #[error("PID echo mismatch: requested 0x{expected:X}, got 0x{got:X}")]
    PidMismatch { expected: u16, got: u16 },

    #[error("expected response service 0x{expected:02X}, got 0x{got:02X}")]
    WrongService { expected: u8, got: u8 },

    #[error("negative response to service 0x{service:02X} (NRC 0x{nrc:02X})")]
    NegativeResponse { service: u8, nrc: u8 },
}

/// Why one ECU produced no value for a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error(transparent)]
    Frame(#[from] FrameAssemblyError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Trouble-code string cannot be packed into a DTC byte pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trouble code {0:?}: expected a letter P/C/B/U followed by four hex digits, first digit 0-3")]
pub struct DtcCodecError(pub String);

/// Trouble-code retrieval failed as a whole.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("trouble-code scan failed: {0}")]
    Transport(#[from] TransportError),

    #[error("trouble-code scan needs a vehicle connection (state: {0})")]
    NotReady(ConnectionState),

    #[error("trouble-code response could not be decoded: {0}")]
    Decode(String),
}

/// Errors surfaced by the adapter session and poller.
#[derive(Debug, Error)]
pub enum ObdError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("adapter initialization failed at {step}: {reason}")]
    AdapterInitializationFailed { step: String, reason: String },

    #[error("adapter reported {0}")]
    Adapter(String),

    #[error("session not ready (state: {state})")]
    NotReady { state: ConnectionState },

    #[error("connection stopped while it was being established")]
    Stopped,

    #[error("ECU 0x{ecu_id:X}: {source}")]
    FrameAssembly {
        ecu_id: u32,
        #[source]
        source: FrameAssemblyError,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Convenience alias for engine results.
pub type ObdResult<T> = Result<T, ObdError>;
