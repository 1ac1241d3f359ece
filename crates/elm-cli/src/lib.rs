//! elmctl library: configuration and the TCP transport for Wi-Fi adapters.

pub mod config;
pub mod tcp;

pub use config::{AdapterConfig, CliConfig};
pub use tcp::TcpTransport;
