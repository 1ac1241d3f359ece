//! OBD-II constants and the frame-level data types.

use serde::{Deserialize, Serialize};

/// CAN arbitration ID an ECU answers under (e.g., 0x7E8, 0x18DAF110).
pub type EcuId = u32;

// ── OBD-II CAN IDs ──────────────────────────────────────────────

/// First OBD-II response CAN ID (ECU #1). Used when lines carry no header.
pub const DEFAULT_ECU_ID: EcuId = 0x7E8;

// ── OBD-II Modes ────────────────────────────────────────────────

/// Mode 01: Show current data (live PIDs).
pub const MODE_CURRENT_DATA: u8 = 0x01;

/// Mode 02: Show freeze frame data.
pub const MODE_FREEZE_FRAME: u8 = 0x02;

/// Mode 04: Clear DTCs and stored values.
pub const MODE_CLEAR_DTCS: u8 = 0x04;

/// Mode 06: On-board monitoring test results.
pub const MODE_MONITOR_TESTS: u8 = 0x06;

/// Mode 09: Request vehicle information (VIN, etc.).
pub const MODE_VEHICLE_INFO: u8 = 0x09;

/// Mode 22: Manufacturer-defined data by identifier.
pub const MODE_MANUFACTURER: u8 = 0x22;

/// Offset added to request mode to get response SID.
pub const RESPONSE_SID_OFFSET: u8 = 0x40;

/// Negative response SID.
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Most PIDs the ELM327 accepts in one composed mode 01 request.
pub const MAX_BATCH_PIDS: usize = 6;

// ── ISO-TP frame type nibbles (upper nibble of byte 0) ────────

/// Single Frame.
pub const ISOTP_SF: u8 = 0x0;
/// First Frame.
pub const ISOTP_FF: u8 = 0x1;
/// Consecutive Frame.
pub const ISOTP_CF: u8 = 0x2;

// ── Frames ──────────────────────────────────────────────────────

/// Protocol control information of one parsed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    /// Complete payload of `len` bytes.
    Single { len: usize },
    /// Start of a segmented payload of `total` bytes.
    First { total: usize },
    /// Continuation with a cyclic sequence number (0–15).
    Consecutive { seq: u8 },
}

/// One parsed adapter response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration ID, present only when headers are enabled.
    pub arbitration_id: Option<EcuId>,
    pub pci: Pci,
    /// Bytes after the PCI.
    pub payload: Vec<u8>,
}

/// A complete payload from one ECU, starting at the response SID byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassembledMessage {
    pub ecu_id: EcuId,
    pub payload: Vec<u8>,
}

impl ReassembledMessage {
    pub fn new(ecu_id: EcuId, payload: Vec<u8>) -> Self {
        Self { ecu_id, payload }
    }
}

/// Format bytes as space-separated uppercase hex (`"41 0C 1A F8"`).
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formatting() {
        assert_eq!(hex_bytes(&[0x41, 0x0C, 0x1A, 0xF8]), "41 0C 1A F8");
        assert_eq!(hex_bytes(&[]), "");
    }
}
