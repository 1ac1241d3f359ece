//! ELM327 OBD-II protocol engine.
//!
//! Provides a `Transport` abstraction over the adapter link, ISO-TP frame
//! reassembly across multiple ECUs, a command catalog with standard PID
//! decoders, trouble-code encoding and metadata, an `AdapterSession` that
//! handshakes and negotiates the vehicle protocol, and a `ContinuousPoller`
//! with adaptive interval.

pub mod catalog;
pub mod config;
pub mod decode;
pub mod dtc;
pub mod dtc_db;
pub mod error;
pub mod extract;
pub mod frame;
pub mod mock;
pub mod poller;
pub mod session;
pub mod transport;
pub mod types;

// Re-export key types for convenience
pub use catalog::{CommandCatalog, CommandFamily, CommandKey, ObdCommand};
pub use config::{PollerConfig, SessionConfig, VendorPid};
pub use decode::Decoder;
pub use dtc::TroubleCodeCodec;
pub use dtc_db::DtcDatabase;
pub use error::{
    DecodeError, FrameAssemblyError, ObdError, ObdResult, ResponseError, ScanError, TransportError,
    TransportResult,
};
pub use extract::{QueryResponse, ResponseExtractor};
pub use frame::{AdapterStatus, AssemblyOutcome, FrameAssembler, FrameLayout};
pub use mock::{MockTransport, Script};
pub use poller::{Backoff, ContinuousPoller, PollCycle};
pub use session::{AdapterSession, VehicleProfile};
pub use transport::{LinkState, ReplySlot, Transport, split_reply};
pub use types::{EcuId, ReassembledMessage};
