//! OBD-II bus protocols as numbered by the ELM327 `ATSP`/`ATDPN` commands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported OBD-II protocols.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (5 baud init, 10.4 kbaud)
    Iso14230_4KwpSlow,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

/// Error returned when a protocol id or name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown OBD protocol: {0:?}")]
pub struct ParseProtocolError(pub String);

impl ObdProtocol {
    /// Candidates tried, in order, when automatic selection fails.
    /// CAN variants first: every vehicle sold since 2008 speaks one of them.
    pub const FALLBACK_ORDER: [ObdProtocol; 9] = [
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4KwpSlow,
        ObdProtocol::Iso14230_4KwpFast,
    ];

    /// The single hex digit the ELM327 uses for this protocol.
    pub fn elm_id(self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::J1850Pwm => '1',
            ObdProtocol::J1850Vpw => '2',
            ObdProtocol::Iso9141_2 => '3',
            ObdProtocol::Iso14230_4KwpSlow => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
        }
    }

    /// Parse an `ATDPN` reply such as `"A6"` (auto-selected CAN 11/500) or `"3"`.
    pub fn from_elm_reply(reply: &str) -> Option<Self> {
        let reply = reply.trim();
        let id = reply.strip_prefix('A').unwrap_or(reply);
        let mut chars = id.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_elm_id(c),
            _ => None,
        }
    }

    pub fn from_elm_id(id: char) -> Option<Self> {
        match id {
            '0' => Some(ObdProtocol::Auto),
            '1' => Some(ObdProtocol::J1850Pwm),
            '2' => Some(ObdProtocol::J1850Vpw),
            '3' => Some(ObdProtocol::Iso9141_2),
            '4' => Some(ObdProtocol::Iso14230_4KwpSlow),
            '5' => Some(ObdProtocol::Iso14230_4KwpFast),
            '6' => Some(ObdProtocol::Iso15765_4Can11bit500),
            '7' => Some(ObdProtocol::Iso15765_4Can29bit500),
            '8' => Some(ObdProtocol::Iso15765_4Can11bit250),
            '9' => Some(ObdProtocol::Iso15765_4Can29bit250),
            _ => None,
        }
    }

    /// `ATSPn` command selecting this protocol.
    pub fn select_command(self) -> String {
        format!("ATSP{}", self.elm_id())
    }

    /// Check if this is a CAN protocol
    pub fn is_can(self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// CAN with 29-bit identifiers.
    pub fn is_extended_can(self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can29bit500 | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM (41.6 kbaud)",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW (10.4 kbaud)",
            ObdProtocol::Iso9141_2 => "ISO 9141-2 (5 baud init)",
            ObdProtocol::Iso14230_4KwpSlow => "ISO 14230-4 KWP (5 baud init)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 CAN (11 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 CAN (29 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 CAN (11 bit ID, 250 kbaud)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 CAN (29 bit ID, 250 kbaud)",
        }
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for ObdProtocol {
    type Err = ParseProtocolError;

    /// Accepts `"auto"` or a single ELM327 protocol digit (`"6"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(ObdProtocol::Auto);
        }
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_elm_id(c),
            _ => None,
        }
        .ok_or_else(|| ParseProtocolError(s.to_string()))
    }
}

impl TryFrom<String> for ObdProtocol {
    type Error = ParseProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObdProtocol> for String {
    fn from(value: ObdProtocol) -> Self {
        match value {
            ObdProtocol::Auto => "auto".to_string(),
            other => other.elm_id().to_string(),
        }
    }
}
