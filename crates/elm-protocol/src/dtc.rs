use serde::{Deserialize, Serialize};

/// OBD-II Diagnostic Trouble Code reported by one ECU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Arbitration ID of the ECU that reported the code (e.g., 0x7E8).
    pub ecu_id: u32,
    /// Standard DTC string (e.g., "P0300", "C0035").
    pub code: String,
    /// DTC category derived from the first character.
    pub category: DtcCategory,
    /// Severity classification (computed from the code, not the metadata table).
    pub severity: DtcSeverity,
    /// Human-readable metadata from the trouble-code table, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DtcMetadata>,
}

/// DTC category based on first character of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    /// P: Powertrain (engine, transmission).
    Powertrain,
    /// C: Chassis (ABS, steering).
    Chassis,
    /// B: Body (airbags, AC, lighting).
    Body,
    /// U: Network/Communication (CAN bus errors).
    Network,
}

impl DtcCategory {
    /// Parse the category from the first character of a code string.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.chars().next() {
            Some('P' | 'p') => Some(Self::Powertrain),
            Some('C' | 'c') => Some(Self::Chassis),
            Some('B' | 'b') => Some(Self::Body),
            Some('U' | 'u') => Some(Self::Network),
            _ => None,
        }
    }

    /// The 2-bit system code carried in the top bits of the first DTC byte.
    pub fn bits(self) -> u8 {
        match self {
            Self::Powertrain => 0b00,
            Self::Chassis => 0b01,
            Self::Body => 0b10,
            Self::Network => 0b11,
        }
    }

    /// Inverse of [`DtcCategory::bits`]; only the low two bits are used.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Powertrain,
            0b01 => Self::Chassis,
            0b10 => Self::Body,
            _ => Self::Network,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }
}

/// Severity classification of a DTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcSeverity {
    /// Informational: no immediate action needed.
    Info,
    /// Warning: schedule maintenance.
    Warning,
    /// Critical: immediate attention required.
    Critical,
    /// Unknown: code could not be classified.
    Unknown,
}

/// Human metadata for a code, loaded from the static trouble-code table.
///
/// Informational only: codec correctness never depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcMetadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub remedies: Vec<String>,
}

/// Which trouble-code list to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcKind {
    /// Mode 03: confirmed codes.
    Stored,
    /// Mode 07: codes detected during the current or last drive cycle.
    Pending,
    /// Mode 0A: codes that survive a clear.
    Permanent,
}

impl DtcKind {
    /// OBD-II service number used to request this list.
    pub fn service(self) -> u8 {
        match self {
            Self::Stored => 0x03,
            Self::Pending => 0x07,
            Self::Permanent => 0x0A,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtc_category_parsing() {
        assert_eq!(DtcCategory::from_code("P0300"), Some(DtcCategory::Powertrain));
        assert_eq!(DtcCategory::from_code("C0035"), Some(DtcCategory::Chassis));
        assert_eq!(DtcCategory::from_code("b0100"), Some(DtcCategory::Body));
        assert_eq!(DtcCategory::from_code("U0100"), Some(DtcCategory::Network));
        assert_eq!(DtcCategory::from_code("X0100"), None);
        assert_eq!(DtcCategory::from_code(""), None);
    }

    #[test]
    fn category_bits_are_inverse() {
        for cat in [
            DtcCategory::Powertrain,
            DtcCategory::Chassis,
            DtcCategory::Body,
            DtcCategory::Network,
        ] {
            assert_eq!(DtcCategory::from_bits(cat.bits()), cat);
        }
        assert_eq!(DtcCategory::Network.letter(), 'U');
    }

    #[test]
    fn dtc_kind_services() {
        assert_eq!(DtcKind::Stored.service(), 0x03);
        assert_eq!(DtcKind::Pending.service(), 0x07);
        assert_eq!(DtcKind::Permanent.service(), 0x0A);
    }

    #[test]
    fn trouble_code_json_shape() {
        let dtc = TroubleCode {
            ecu_id: 0x7E8,
            code: "P0302".into(),
            category: DtcCategory::Powertrain,
            severity: DtcSeverity::Critical,
            metadata: Some(DtcMetadata {
                title: "Cylinder 2 Misfire Detected".into(),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&dtc).unwrap();
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["category"], "powertrain");
        assert_eq!(json["metadata"]["title"], "Cylinder 2 Misfire Detected");

        let back: TroubleCode = serde_json::from_value(json).unwrap();
        assert_eq!(back, dtc);
    }

    #[test]
    fn metadata_defaults_missing_lists() {
        let meta: DtcMetadata = serde_json::from_str(r#"{"title":"System Too Lean"}"#).unwrap();
        assert!(meta.causes.is_empty());
        assert!(meta.remedies.is_empty());
    }
}
