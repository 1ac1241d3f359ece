//! Command catalog: every request this client knows how to issue and decode.
//!
//! Built once at startup, immutable afterwards. Entries are keyed by
//! (service, PID); whether a vehicle actually answers a PID is tracked by
//! the session, not here.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use elm_protocol::{DecodeResult, Unit};
use serde::{Deserialize, Serialize};

use crate::config::VendorPid;
use crate::decode::Decoder;
use crate::error::DecodeError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Keys and families
// ---------------------------------------------------------------------------

/// (service, PID) pair identifying a catalog entry. Prints as `"010C"` or,
/// for two-byte identifiers, `"22F40D"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandKey {
    pub service: u8,
    pub pid: u16,
}

impl CommandKey {
    pub const fn new(service: u8, pid: u16) -> Self {
        Self { service, pid }
    }

    /// Mode 01 key.
    pub const fn live(pid: u8) -> Self {
        Self::new(MODE_CURRENT_DATA, pid as u16)
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.service == MODE_MANUFACTURER {
            write!(f, "{:02X}{:04X}", self.service, self.pid)
        } else {
            write!(f, "{:02X}{:02X}", self.service, self.pid)
        }
    }
}

impl FromStr for CommandKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let invalid = || format!("invalid command key {s:?}: expected e.g. \"010C\" or \"22F40D\"");
        let service = compact
            .get(..2)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(invalid)?;
        let pid_hex = compact.get(2..).ok_or_else(invalid)?;
        let expected_len = if service == MODE_MANUFACTURER { 4 } else { 2 };
        if pid_hex.len() != expected_len {
            return Err(invalid());
        }
        let pid = u16::from_str_radix(pid_hex, 16).map_err(|_| invalid())?;
        Ok(Self::new(service, pid))
    }
}

impl TryFrom<String> for CommandKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandKey> for String {
    fn from(value: CommandKey) -> Self {
        value.to_string()
    }
}

/// Command families, each with its own request shape and decode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandFamily {
    /// Mode 01 live data PID.
    LiveData(u8),
    /// Mode 02 freeze-frame PID (frame 0).
    FreezeFrame(u8),
    /// Mode 06 on-board monitor id.
    MonitorTest(u8),
    /// Mode 09 info type.
    VehicleInfo(u8),
    /// Mode 22 manufacturer data identifier.
    Manufacturer(u16),
}

impl CommandFamily {
    pub fn from_key(key: CommandKey) -> Option<Self> {
        let byte = u8::try_from(key.pid).ok();
        match key.service {
            MODE_CURRENT_DATA => byte.map(Self::LiveData),
            MODE_FREEZE_FRAME => byte.map(Self::FreezeFrame),
            MODE_MONITOR_TESTS => byte.map(Self::MonitorTest),
            MODE_VEHICLE_INFO => byte.map(Self::VehicleInfo),
            MODE_MANUFACTURER => Some(Self::Manufacturer(key.pid)),
            _ => None,
        }
    }

    pub fn key(self) -> CommandKey {
        match self {
            Self::LiveData(pid) => CommandKey::new(MODE_CURRENT_DATA, pid.into()),
            Self::FreezeFrame(pid) => CommandKey::new(MODE_FREEZE_FRAME, pid.into()),
            Self::MonitorTest(mid) => CommandKey::new(MODE_MONITOR_TESTS, mid.into()),
            Self::VehicleInfo(info) => CommandKey::new(MODE_VEHICLE_INFO, info.into()),
            Self::Manufacturer(did) => CommandKey::new(MODE_MANUFACTURER, did),
        }
    }

    pub fn service(self) -> u8 {
        self.key().service
    }

    /// Request string sent to the adapter.
    pub fn request(self) -> String {
        match self {
            Self::LiveData(pid) => format!("{MODE_CURRENT_DATA:02X}{pid:02X}"),
            Self::FreezeFrame(pid) => format!("{MODE_FREEZE_FRAME:02X}{pid:02X}00"),
            Self::MonitorTest(mid) => format!("{MODE_MONITOR_TESTS:02X}{mid:02X}"),
            Self::VehicleInfo(info) => format!("{MODE_VEHICLE_INFO:02X}{info:02X}"),
            Self::Manufacturer(did) => format!("{MODE_MANUFACTURER:02X}{did:04X}"),
        }
    }

    /// Bytes between the response SID and the data: the echoed identifier,
    /// plus the frame number for freeze frames.
    pub fn echo_len(self) -> usize {
        match self {
            Self::LiveData(_) | Self::MonitorTest(_) | Self::VehicleInfo(_) => 1,
            Self::FreezeFrame(_) | Self::Manufacturer(_) => 2,
        }
    }

    /// Identifier echoed after the response SID.
    pub fn echoed_pid(self, echo: &[u8]) -> Option<u16> {
        match self {
            Self::Manufacturer(_) => {
                let pair = echo.get(..2)?;
                Some(u16::from_be_bytes([pair[0], pair[1]]))
            }
            _ => echo.first().map(|b| u16::from(*b)),
        }
    }

    pub fn pid(self) -> u16 {
        self.key().pid
    }
}

impl fmt::Display for CommandFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// An immutable catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ObdCommand {
    pub family: CommandFamily,
    pub name: Cow<'static, str>,
    /// Expected data bytes after the echoed PID. Zero for variable length.
    pub length: usize,
    pub decoder: Decoder,
    /// A live value worth polling, as opposed to a bitmap or identifier.
    /// Says nothing about the connected vehicle: per-vehicle support comes
    /// from the PID bitmaps in `VehicleProfile`, see
    /// `AdapterSession::is_supported`.
    pub live: bool,
}

impl ObdCommand {
    pub fn key(&self) -> CommandKey {
        self.family.key()
    }

    /// Decode the data bytes that follow the echoed PID.
    pub fn decode(&self, data: &[u8]) -> Result<DecodeResult, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::NoData);
        }
        if data.len() < self.length {
            return Err(DecodeError::InsufficientLength {
                expected: self.length,
                got: data.len(),
            });
        }
        self.decoder.decode(data)
    }
}

/// Registry of every known command.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    entries: BTreeMap<CommandKey, ObdCommand>,
}

impl CommandCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// All standard commands (modes 01, 02, 06, 09).
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for (pid, name, length, decoder) in live_data_table() {
            let live = !matches!(
                decoder,
                Decoder::SupportBitmap { .. } | Decoder::Readiness
            );
            // Monitor status has no freeze-frame counterpart.
            if !matches!(decoder, Decoder::Readiness) {
                catalog.insert(ObdCommand {
                    family: CommandFamily::FreezeFrame(pid),
                    name: Cow::Owned(format!("Freeze frame: {name}")),
                    length,
                    decoder: decoder.clone(),
                    live: false,
                });
            }
            catalog.insert(ObdCommand {
                family: CommandFamily::LiveData(pid),
                name: Cow::Borrowed(name),
                length,
                decoder,
                live,
            });
        }
        for (info, name, length, decoder) in vehicle_info_table() {
            catalog.insert(ObdCommand {
                family: CommandFamily::VehicleInfo(info),
                name: Cow::Borrowed(name),
                length,
                decoder,
                live: false,
            });
        }
        for (mid, name) in MONITOR_IDS {
            let decoder = if mid % 0x20 == 0 {
                Decoder::SupportBitmap { base: *mid }
            } else {
                Decoder::MonitorTests
            };
            catalog.insert(ObdCommand {
                family: CommandFamily::MonitorTest(*mid),
                name: Cow::Borrowed(*name),
                length: decoder.min_len(),
                decoder,
                live: false,
            });
        }
        catalog
    }

    /// Standard commands plus manufacturer PIDs.
    pub fn with_vendor_pids(vendor: &[VendorPid]) -> Self {
        let mut catalog = Self::standard();
        for pid in vendor {
            catalog.insert(pid.to_command());
        }
        catalog
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, command: ObdCommand) {
        self.entries.insert(command.key(), command);
    }

    pub fn get(&self, key: CommandKey) -> Option<&ObdCommand> {
        self.entries.get(&key)
    }

    pub fn family(&self, family: CommandFamily) -> Option<&ObdCommand> {
        self.get(family.key())
    }

    /// Look up by `"010C"`-style key.
    pub fn lookup(&self, key: &str) -> Option<&ObdCommand> {
        key.parse().ok().and_then(|k| self.get(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObdCommand> {
        self.entries.values()
    }

    /// Entries that carry a pollable live value.
    pub fn live(&self) -> impl Iterator<Item = &ObdCommand> {
        self.entries.values().filter(|c| c.live)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Standard tables
// ---------------------------------------------------------------------------

const SECONDARY_AIR: &[(u8, &str)] = &[
    (0x01, "upstream"),
    (0x02, "downstream of catalytic converter"),
    (0x04, "from the outside atmosphere or off"),
    (0x08, "pump commanded on for diagnostics"),
];

const OBD_STANDARDS: &[(u8, &str)] = &[
    (0x01, "OBD-II as defined by the CARB"),
    (0x02, "OBD as defined by the EPA"),
    (0x03, "OBD and OBD-II"),
    (0x04, "OBD-I"),
    (0x05, "Not OBD compliant"),
    (0x06, "EOBD (Europe)"),
    (0x07, "EOBD and OBD-II"),
    (0x08, "EOBD and OBD"),
    (0x09, "EOBD, OBD and OBD II"),
    (0x0A, "JOBD (Japan)"),
    (0x0B, "JOBD and OBD II"),
    (0x0C, "JOBD and EOBD"),
    (0x0D, "JOBD, EOBD, and OBD II"),
    (0x11, "Engine Manufacturer Diagnostics (EMD)"),
    (0x12, "Engine Manufacturer Diagnostics Enhanced (EMD+)"),
    (0x13, "Heavy Duty On-Board Diagnostics (Child/Partial) (HD OBD-C)"),
    (0x14, "Heavy Duty On-Board Diagnostics (HD OBD)"),
    (0x15, "World Wide Harmonized OBD (WWH OBD)"),
    (0x17, "Heavy Duty Euro OBD Stage I without NOx control (HD EOBD-I)"),
    (0x1D, "Brazil OBD Phase 1 (OBDBr-1)"),
    (0x1E, "Brazil OBD Phase 2 (OBDBr-2)"),
    (0x1F, "Korean OBD (KOBD)"),
    (0x20, "India OBD I (IOBD-I)"),
    (0x21, "India OBD II (IOBD-II)"),
];

const FUEL_TYPES: &[(u8, &str)] = &[
    (0x00, "Not available"),
    (0x01, "Gasoline"),
    (0x02, "Methanol"),
    (0x03, "Ethanol"),
    (0x04, "Diesel"),
    (0x05, "LPG"),
    (0x06, "CNG"),
    (0x07, "Propane"),
    (0x08, "Electric"),
    (0x09, "Bifuel running Gasoline"),
    (0x0A, "Bifuel running Methanol"),
    (0x0B, "Bifuel running Ethanol"),
    (0x0C, "Bifuel running LPG"),
    (0x0D, "Bifuel running CNG"),
    (0x0E, "Bifuel running Propane"),
    (0x0F, "Bifuel running Electricity"),
    (0x10, "Bifuel running electric and combustion engine"),
    (0x11, "Hybrid gasoline"),
    (0x12, "Hybrid Ethanol"),
    (0x13, "Hybrid Diesel"),
    (0x14, "Hybrid Electric"),
    (0x15, "Hybrid running electric and combustion engine"),
    (0x16, "Hybrid Regenerative"),
    (0x17, "Bifuel running diesel"),
];

const O2_SENSORS_PRESENT: &[&str] = &[
    "B1S1", "B1S2", "B1S3", "B1S4", "B2S1", "B2S2", "B2S3", "B2S4",
];

const AUX_INPUT: &[&str] = &["PTO active"];

type TableRow = (u8, &'static str, usize, Decoder);

fn live_data_table() -> Vec<TableRow> {
    use Decoder as D;
    let volts_o2 = || D::linear(1, 0.005, 0.0, Unit::Volts);
    let lambda = || D::linear(2, 2.0 / 65536.0, 0.0, Unit::Ratio);
    let catalyst = || D::linear(2, 0.1, -40.0, Unit::Celsius);
    let torque = || D::linear(1, 1.0, -125.0, Unit::Percent);

    vec![
        (0x00, "Supported PIDs 01-20", 4, D::SupportBitmap { base: 0x00 }),
        (0x01, "Monitor status since DTCs cleared", 4, D::Readiness),
        (0x03, "Fuel system status", 2, D::FuelSystemStatus),
        (0x04, "Calculated engine load", 1, D::percent()),
        (0x05, "Engine coolant temperature", 1, D::temperature()),
        (0x06, "Short term fuel trim bank 1", 1, D::trim()),
        (0x07, "Long term fuel trim bank 1", 1, D::trim()),
        (0x08, "Short term fuel trim bank 2", 1, D::trim()),
        (0x09, "Long term fuel trim bank 2", 1, D::trim()),
        (0x0A, "Fuel pressure", 1, D::linear(1, 3.0, 0.0, Unit::Kilopascal)),
        (0x0B, "Intake manifold absolute pressure", 1, D::linear(1, 1.0, 0.0, Unit::Kilopascal)),
        (0x0C, "Engine RPM", 2, D::linear(2, 0.25, 0.0, Unit::Rpm)),
        (0x0D, "Vehicle speed", 1, D::linear(1, 1.0, 0.0, Unit::KilometersPerHour)),
        (0x0E, "Timing advance", 1, D::linear(1, 0.5, -64.0, Unit::Degrees)),
        (0x0F, "Intake air temperature", 1, D::temperature()),
        (0x10, "Mass air flow rate", 2, D::linear(2, 0.01, 0.0, Unit::GramsPerSecond)),
        (0x11, "Throttle position", 1, D::percent()),
        (0x12, "Commanded secondary air status", 1, D::Enumerated(SECONDARY_AIR)),
        (0x13, "Oxygen sensors present", 1, D::NamedBits(O2_SENSORS_PRESENT)),
        (0x14, "Oxygen sensor 1 voltage", 2, volts_o2()),
        (0x15, "Oxygen sensor 2 voltage", 2, volts_o2()),
        (0x16, "Oxygen sensor 3 voltage", 2, volts_o2()),
        (0x17, "Oxygen sensor 4 voltage", 2, volts_o2()),
        (0x18, "Oxygen sensor 5 voltage", 2, volts_o2()),
        (0x19, "Oxygen sensor 6 voltage", 2, volts_o2()),
        (0x1A, "Oxygen sensor 7 voltage", 2, volts_o2()),
        (0x1B, "Oxygen sensor 8 voltage", 2, volts_o2()),
        (0x1C, "OBD standard", 1, D::Enumerated(OBD_STANDARDS)),
        (0x1E, "Auxiliary input status", 1, D::NamedBits(AUX_INPUT)),
        (0x1F, "Run time since engine start", 2, D::linear(2, 1.0, 0.0, Unit::Seconds)),
        (0x20, "Supported PIDs 21-40", 4, D::SupportBitmap { base: 0x20 }),
        (0x21, "Distance traveled with MIL on", 2, D::linear(2, 1.0, 0.0, Unit::Kilometers)),
        (0x22, "Fuel rail pressure (relative)", 2, D::linear(2, 0.079, 0.0, Unit::Kilopascal)),
        (0x23, "Fuel rail gauge pressure", 2, D::linear(2, 10.0, 0.0, Unit::Kilopascal)),
        (0x24, "Oxygen sensor 1 equivalence ratio", 4, lambda()),
        (0x25, "Oxygen sensor 2 equivalence ratio", 4, lambda()),
        (0x26, "Oxygen sensor 3 equivalence ratio", 4, lambda()),
        (0x27, "Oxygen sensor 4 equivalence ratio", 4, lambda()),
        (0x28, "Oxygen sensor 5 equivalence ratio", 4, lambda()),
        (0x29, "Oxygen sensor 6 equivalence ratio", 4, lambda()),
        (0x2A, "Oxygen sensor 7 equivalence ratio", 4, lambda()),
        (0x2B, "Oxygen sensor 8 equivalence ratio", 4, lambda()),
        (0x2C, "Commanded EGR", 1, D::percent()),
        (0x2D, "EGR error", 1, D::trim()),
        (0x2E, "Commanded evaporative purge", 1, D::percent()),
        (0x2F, "Fuel tank level input", 1, D::percent()),
        (0x30, "Warm-ups since codes cleared", 1, D::linear(1, 1.0, 0.0, Unit::Count)),
        (0x31, "Distance traveled since codes cleared", 2, D::linear(2, 1.0, 0.0, Unit::Kilometers)),
        (
            0x32,
            "Evap system vapor pressure",
            2,
            D::Linear {
                width: 2,
                scale: 0.25,
                offset: 0.0,
                signed: true,
                unit: Unit::Pascal,
            },
        ),
        (0x33, "Absolute barometric pressure", 1, D::linear(1, 1.0, 0.0, Unit::Kilopascal)),
        (0x3C, "Catalyst temperature bank 1 sensor 1", 2, catalyst()),
        (0x3D, "Catalyst temperature bank 2 sensor 1", 2, catalyst()),
        (0x3E, "Catalyst temperature bank 1 sensor 2", 2, catalyst()),
        (0x3F, "Catalyst temperature bank 2 sensor 2", 2, catalyst()),
        (0x40, "Supported PIDs 41-60", 4, D::SupportBitmap { base: 0x40 }),
        (0x41, "Monitor status this drive cycle", 4, D::Readiness),
        (0x42, "Control module voltage", 2, D::linear(2, 0.001, 0.0, Unit::Volts)),
        (0x43, "Absolute load value", 2, D::linear(2, 100.0 / 255.0, 0.0, Unit::Percent)),
        (0x44, "Commanded air-fuel equivalence ratio", 2, lambda()),
        (0x45, "Relative throttle position", 1, D::percent()),
        (0x46, "Ambient air temperature", 1, D::temperature()),
        (0x47, "Absolute throttle position B", 1, D::percent()),
        (0x48, "Absolute throttle position C", 1, D::percent()),
        (0x49, "Accelerator pedal position D", 1, D::percent()),
        (0x4A, "Accelerator pedal position E", 1, D::percent()),
        (0x4B, "Accelerator pedal position F", 1, D::percent()),
        (0x4C, "Commanded throttle actuator", 1, D::percent()),
        (0x4D, "Time run with MIL on", 2, D::linear(2, 1.0, 0.0, Unit::Minutes)),
        (0x4E, "Time since trouble codes cleared", 2, D::linear(2, 1.0, 0.0, Unit::Minutes)),
        (0x51, "Fuel type", 1, D::Enumerated(FUEL_TYPES)),
        (0x52, "Ethanol fuel percentage", 1, D::percent()),
        (0x59, "Fuel rail absolute pressure", 2, D::linear(2, 10.0, 0.0, Unit::Kilopascal)),
        (0x5A, "Relative accelerator pedal position", 1, D::percent()),
        (0x5B, "Hybrid battery pack remaining life", 1, D::percent()),
        (0x5C, "Engine oil temperature", 1, D::temperature()),
        (0x5D, "Fuel injection timing", 2, D::linear(2, 1.0 / 128.0, -210.0, Unit::Degrees)),
        (0x5E, "Engine fuel rate", 2, D::linear(2, 0.05, 0.0, Unit::LitersPerHour)),
        (0x60, "Supported PIDs 61-80", 4, D::SupportBitmap { base: 0x60 }),
        (0x61, "Driver's demand engine torque", 1, torque()),
        (0x62, "Actual engine torque", 1, torque()),
        (0x80, "Supported PIDs 81-A0", 4, D::SupportBitmap { base: 0x80 }),
        (0xA0, "Supported PIDs A1-C0", 4, D::SupportBitmap { base: 0xA0 }),
        (0xA6, "Odometer", 4, D::linear(4, 0.1, 0.0, Unit::Kilometers)),
        (0xC0, "Supported PIDs C1-E0", 4, D::SupportBitmap { base: 0xC0 }),
    ]
}

fn vehicle_info_table() -> Vec<TableRow> {
    vec![
        (0x00, "Supported info types 01-20", 4, Decoder::SupportBitmap { base: 0x00 }),
        (0x02, "Vehicle identification number", 18, Decoder::Ascii { skip: 1 }),
        (0x04, "Calibration ID", 0, Decoder::Ascii { skip: 1 }),
        (0x0A, "ECU name", 0, Decoder::Ascii { skip: 1 }),
    ]
}

const MONITOR_IDS: &[(u8, &str)] = &[
    (0x00, "Supported monitors 01-20"),
    (0x01, "Oxygen sensor monitor bank 1 sensor 1"),
    (0x02, "Oxygen sensor monitor bank 1 sensor 2"),
    (0x03, "Oxygen sensor monitor bank 1 sensor 3"),
    (0x05, "Oxygen sensor monitor bank 2 sensor 1"),
    (0x06, "Oxygen sensor monitor bank 2 sensor 2"),
    (0x20, "Supported monitors 21-40"),
    (0x21, "Catalyst monitor bank 1"),
    (0x22, "Catalyst monitor bank 2"),
    (0x31, "EGR monitor bank 1"),
    (0x35, "VVT monitor bank 1"),
    (0x39, "EVAP monitor (cap off)"),
    (0x3A, "EVAP monitor (0.090\")"),
    (0x3B, "EVAP monitor (0.040\")"),
    (0x3C, "EVAP monitor (0.020\")"),
    (0x3D, "Purge flow monitor"),
    (0x40, "Supported monitors 41-60"),
    (0x41, "Oxygen sensor heater monitor bank 1 sensor 1"),
    (0x42, "Oxygen sensor heater monitor bank 1 sensor 2"),
    (0x45, "Oxygen sensor heater monitor bank 2 sensor 1"),
    (0x60, "Supported monitors 61-80"),
    (0x61, "Heated catalyst monitor bank 1"),
    (0x71, "Secondary air monitor 1"),
    (0x80, "Supported monitors 81-A0"),
    (0x81, "Fuel system monitor bank 1"),
    (0x82, "Fuel system monitor bank 2"),
    (0xA0, "Supported monitors A1-C0"),
    (0xA1, "Misfire monitor general data"),
    (0xA2, "Misfire cylinder 1 data"),
    (0xA3, "Misfire cylinder 2 data"),
    (0xA4, "Misfire cylinder 3 data"),
    (0xA5, "Misfire cylinder 4 data"),
    (0xA6, "Misfire cylinder 5 data"),
    (0xA7, "Misfire cylinder 6 data"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parsing_and_display() {
        let rpm: CommandKey = "010C".parse().unwrap();
        assert_eq!(rpm, CommandKey::live(0x0C));
        assert_eq!(rpm.to_string(), "010C");

        let vendor: CommandKey = "22 F4 0D".parse().unwrap();
        assert_eq!(vendor, CommandKey::new(0x22, 0xF40D));
        assert_eq!(vendor.to_string(), "22F40D");

        assert!("01".parse::<CommandKey>().is_err());
        assert!("010C0D".parse::<CommandKey>().is_err());
        assert!("22F4".parse::<CommandKey>().is_err());
        assert!("ZZ0C".parse::<CommandKey>().is_err());
    }

    #[test]
    fn key_serializes_as_string() {
        let json = serde_json::to_string(&CommandKey::live(0x05)).unwrap();
        assert_eq!(json, r#""0105""#);
        let back: CommandKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CommandKey::live(0x05));
    }

    #[test]
    fn family_requests() {
        assert_eq!(CommandFamily::LiveData(0x0C).request(), "010C");
        assert_eq!(CommandFamily::FreezeFrame(0x05).request(), "020500");
        assert_eq!(CommandFamily::MonitorTest(0x21).request(), "0621");
        assert_eq!(CommandFamily::VehicleInfo(0x02).request(), "0902");
        assert_eq!(CommandFamily::Manufacturer(0xF40D).request(), "22F40D");
    }

    #[test]
    fn family_from_key() {
        assert_eq!(
            CommandFamily::from_key(CommandKey::new(0x22, 0x1234)),
            Some(CommandFamily::Manufacturer(0x1234))
        );
        assert_eq!(CommandFamily::from_key(CommandKey::new(0x01, 0x100)), None);
        assert_eq!(CommandFamily::from_key(CommandKey::new(0x03, 0x00)), None);
    }

    #[test]
    fn echoed_pid_widths() {
        assert_eq!(CommandFamily::Manufacturer(0xF40D).echoed_pid(&[0xF4, 0x0D]), Some(0xF40D));
        assert_eq!(CommandFamily::LiveData(0x0C).echoed_pid(&[0x0C]), Some(0x0C));
        assert_eq!(CommandFamily::FreezeFrame(0x0C).echo_len(), 2);
    }

    #[test]
    fn standard_catalog_has_core_entries() {
        let catalog = CommandCatalog::standard();
        let rpm = catalog.lookup("010C").unwrap();
        assert_eq!(rpm.name, "Engine RPM");
        assert!(rpm.live);
        assert_eq!(rpm.decode(&[0x1A, 0xF8]).unwrap().value(), Some(1654.0));

        let coolant = catalog.family(CommandFamily::LiveData(0x05)).unwrap();
        assert_eq!(coolant.decode(&[0x5A]).unwrap().value(), Some(50.0));

        assert!(!catalog.lookup("0100").unwrap().live);
        assert!(catalog.lookup("020C").is_some());
        assert!(catalog.lookup("0201").is_none());
        assert!(catalog.lookup("0902").is_some());
        assert!(catalog.lookup("06A2").is_some());
        assert!(catalog.live().count() >= 50);
    }

    #[test]
    fn short_payload_yields_insufficient_length() {
        let catalog = CommandCatalog::standard();
        let rpm = catalog.lookup("010C").unwrap();
        assert_eq!(
            rpm.decode(&[0x1A]),
            Err(DecodeError::InsufficientLength { expected: 2, got: 1 })
        );
        assert_eq!(rpm.decode(&[]), Err(DecodeError::NoData));
    }

    #[test]
    fn vendor_pids_extend_catalog() {
        let vendor = VendorPid {
            name: "Transmission fluid temperature".into(),
            did: 0x1E1C,
            length: 2,
            scale: 0.0625,
            offset: -40.0,
            signed: false,
            unit: Unit::Celsius,
        };
        let catalog = CommandCatalog::with_vendor_pids(&[vendor]);
        let entry = catalog.lookup("221E1C").unwrap();
        assert!(entry.live);
        assert_eq!(entry.decode(&[0x05, 0x00]).unwrap().value(), Some(40.0));
    }
}
