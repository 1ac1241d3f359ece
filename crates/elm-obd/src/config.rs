//! Session and poller configuration.
//!
//! Plain values passed to constructors; every field has a default so an
//! empty TOML table is a valid configuration.

use std::borrow::Cow;
use std::time::Duration;

use elm_protocol::{MeasurementSystem, ObdProtocol, Unit};
use serde::{Deserialize, Serialize};

use crate::catalog::{CommandFamily, CommandKey, ObdCommand};
use crate::decode::Decoder;
use crate::types::{DEFAULT_ECU_ID, EcuId};

/// Adapter session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Transport connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-exchange reply timeout in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Attempts per handshake step and per protocol candidate.
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,
    /// Base delay between attempts; attempt `n` waits `n × retry_delay_ms`.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// `auto` or an explicit ELM327 protocol digit.
    #[serde(default)]
    pub protocol: ObdProtocol,
    /// Ask the adapter to print CAN headers (needed to tell ECUs apart).
    #[serde(default = "default_true")]
    pub headers: bool,
    /// ECU id assumed for lines without a header.
    #[serde(default = "default_ecu_id")]
    pub default_ecu_id: EcuId,
    /// Reject responses whose echoed PID differs from the requested one.
    #[serde(default)]
    pub verify_pid_echo: bool,
    #[serde(default)]
    pub measurement: MeasurementSystem,
    /// Walk the supported-PID bitmaps after negotiation.
    #[serde(default = "default_true")]
    pub discover_supported_pids: bool,
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_command_timeout() -> u64 {
    5_000
}

fn default_init_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_ecu_id() -> EcuId {
    DEFAULT_ECU_ID
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            init_retries: default_init_retries(),
            retry_delay_ms: default_retry_delay(),
            protocol: ObdProtocol::Auto,
            headers: true,
            default_ecu_id: DEFAULT_ECU_ID,
            verify_pid_echo: false,
            measurement: MeasurementSystem::Metric,
            discover_supported_pids: true,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Delay before retry `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// At least one attempt, whatever the configured count.
    pub fn attempts(&self) -> u32 {
        self.init_retries.max(1)
    }
}

/// Continuous polling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_base_interval")]
    pub base_interval_ms: u64,
    /// Commands polled each cycle, as `"010C"`-style keys.
    #[serde(default = "default_commands")]
    pub commands: Vec<CommandKey>,
    /// Compose up to six mode 01 PIDs into one request.
    #[serde(default)]
    pub batch: bool,
}

fn default_base_interval() -> u64 {
    1_000
}

fn default_commands() -> Vec<CommandKey> {
    [0x0C, 0x0D, 0x05].into_iter().map(CommandKey::live).collect()
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval(),
            commands: default_commands(),
            batch: false,
        }
    }
}

impl PollerConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

/// A manufacturer (mode 22) PID decoded with a linear formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorPid {
    pub name: String,
    /// Two-byte data identifier.
    pub did: u16,
    /// Data bytes after the echoed identifier (1–4).
    #[serde(default = "default_vendor_length")]
    pub length: u8,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_unit")]
    pub unit: Unit,
}

fn default_vendor_length() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_unit() -> Unit {
    Unit::None
}

impl VendorPid {
    pub fn to_command(&self) -> ObdCommand {
        let width = self.length.clamp(1, 4);
        ObdCommand {
            family: CommandFamily::Manufacturer(self.did),
            name: Cow::Owned(self.name.clone()),
            length: usize::from(width),
            decoder: Decoder::Linear {
                width,
                scale: self.scale,
                offset: self.offset,
                signed: self.signed,
                unit: self.unit,
            },
            live: true,
        }
    }
}
