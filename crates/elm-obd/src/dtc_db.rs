//! Trouble-code metadata table and severity heuristics.
//!
//! The packaged table is parsed once from `data/dtc_metadata.json` and never
//! mutated. Severity is derived from the code itself, so an unknown code
//! still gets a sensible classification.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use elm_protocol::{DtcCategory, DtcMetadata, DtcSeverity, TroubleCode};
use thiserror::Error;

use crate::types::EcuId;

const PACKAGED_JSON: &str = include_str!("../data/dtc_metadata.json");

static PACKAGED: LazyLock<DtcDatabase> = LazyLock::new(|| match DtcDatabase::from_json(PACKAGED_JSON) {
    Ok(db) => db,
    Err(e) => {
        tracing::error!(error = %e, "packaged trouble-code table is invalid; metadata disabled");
        DtcDatabase::default()
    }
});

#[derive(Debug, Error)]
pub enum DtcDatabaseError {
    #[error("failed to read trouble-code table: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid trouble-code table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Read-only map from code string to human metadata.
#[derive(Debug, Clone, Default)]
pub struct DtcDatabase {
    entries: HashMap<String, DtcMetadata>,
}

impl DtcDatabase {
    /// The table shipped with this crate.
    pub fn packaged() -> &'static DtcDatabase {
        &PACKAGED
    }

    /// Parse a JSON object of `"P0302": { "title": ..., ... }` entries.
    pub fn from_json(json: &str) -> Result<Self, DtcDatabaseError> {
        let raw: HashMap<String, DtcMetadata> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .map(|(code, meta)| (code.to_ascii_uppercase(), meta))
            .collect();
        Ok(Self { entries })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DtcDatabaseError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, code: &str) -> Option<&DtcMetadata> {
        self.entries.get(&code.trim().to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach category, severity and metadata to a decoded code.
    pub fn resolve(&self, ecu_id: EcuId, code: String) -> TroubleCode {
        let category = DtcCategory::from_code(&code).unwrap_or(DtcCategory::Powertrain);
        TroubleCode {
            ecu_id,
            category,
            severity: severity_for(&code),
            metadata: self.lookup(&code).cloned(),
            code,
        }
    }
}

/// Classify a code by its prefix ranges.
///
/// Critical: misfire, crank/cam position, overheating, oil pressure,
/// transmission control faults, hybrid battery, restraint systems and lost
/// communication. Info: catalyst efficiency and evaporative emissions.
pub fn severity_for(code: &str) -> DtcSeverity {
    let code = code.trim().to_ascii_uppercase();
    let Some(category) = DtcCategory::from_code(&code) else {
        return DtcSeverity::Unknown;
    };
    let Some(number) = code
        .get(1..)
        .filter(|n| n.len() == 4)
        .and_then(|n| u16::from_str_radix(n, 16).ok())
    else {
        return DtcSeverity::Unknown;
    };

    match (category, number) {
        (DtcCategory::Powertrain, 0x0300..=0x0309)
        | (DtcCategory::Powertrain, 0x0335..=0x0349)
        | (DtcCategory::Powertrain, 0x0217..=0x0218)
        | (DtcCategory::Powertrain, 0x0520..=0x0524)
        | (DtcCategory::Powertrain, 0x0700)
        | (DtcCategory::Powertrain, 0x0730..=0x0736)
        | (DtcCategory::Powertrain, 0x0A80)
        | (DtcCategory::Body, 0x0001..=0x0199)
        | (DtcCategory::Network, 0x0001..=0x0139) => DtcSeverity::Critical,
        (DtcCategory::Powertrain, 0x0420..=0x0459) => DtcSeverity::Info,
        _ => DtcSeverity::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_table_loads() {
        let db = DtcDatabase::packaged();
        assert!(db.len() >= 80);
        let misfire = db.lookup("P0302").unwrap();
        assert!(misfire.title.contains("Misfire"));
        assert!(!misfire.causes.is_empty());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let db = DtcDatabase::packaged();
        assert!(db.lookup("p0300").is_some());
        assert!(db.lookup("u0100").unwrap().title.contains("Lost Communication"));
        assert!(db.lookup("P9999").is_none());
    }

    #[test]
    fn custom_table_from_json() {
        let db = DtcDatabase::from_json(r#"{"p1234": {"title": "Vendor fault"}}"#).unwrap();
        assert_eq!(db.lookup("P1234").unwrap().title, "Vendor fault");
        assert!(DtcDatabase::from_json("[1, 2]").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = DtcDatabase::from_file("/nonexistent/dtc.json");
        assert!(matches!(result, Err(DtcDatabaseError::Io(_))));
    }

    #[test]
    fn severity_heuristics() {
        assert_eq!(severity_for("P0300"), DtcSeverity::Critical);
        assert_eq!(severity_for("P0302"), DtcSeverity::Critical);
        assert_eq!(severity_for("P0217"), DtcSeverity::Critical);
        assert_eq!(severity_for("U0100"), DtcSeverity::Critical);
        assert_eq!(severity_for("B0100"), DtcSeverity::Critical);
        assert_eq!(severity_for("P0440"), DtcSeverity::Info);
        assert_eq!(severity_for("P0420"), DtcSeverity::Info);
        assert_eq!(severity_for("P0171"), DtcSeverity::Warning);
        assert_eq!(severity_for("C0035"), DtcSeverity::Warning);
        assert_eq!(severity_for("X0000"), DtcSeverity::Unknown);
        assert_eq!(severity_for("P03"), DtcSeverity::Unknown);
    }

    #[test]
    fn resolve_without_metadata_still_classifies() {
        let db = DtcDatabase::default();
        let code = db.resolve(0x7E8, "P0301".into());
        assert_eq!(code.severity, DtcSeverity::Critical);
        assert_eq!(code.category, DtcCategory::Powertrain);
        assert!(code.metadata.is_none());
    }
}
