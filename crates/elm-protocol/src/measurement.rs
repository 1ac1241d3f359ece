//! Decoded values: physical measurements, flag sets, and text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unit preference applied when values are extracted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSystem {
    #[default]
    Metric,
    Imperial,
}

/// Physical unit attached to a decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Rpm,
    KilometersPerHour,
    MilesPerHour,
    Celsius,
    Fahrenheit,
    Percent,
    Kilopascal,
    Pascal,
    Psi,
    GramsPerSecond,
    Volts,
    Milliamps,
    Degrees,
    Seconds,
    Minutes,
    Kilometers,
    Miles,
    LitersPerHour,
    GallonsPerHour,
    Ratio,
    Count,
    None,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::KilometersPerHour => "km/h",
            Self::MilesPerHour => "mph",
            Self::Celsius => "°C",
            Self::Fahrenheit => "°F",
            Self::Percent => "%",
            Self::Kilopascal => "kPa",
            Self::Pascal => "Pa",
            Self::Psi => "psi",
            Self::GramsPerSecond => "g/s",
            Self::Volts => "V",
            Self::Milliamps => "mA",
            Self::Degrees => "°",
            Self::Seconds => "s",
            Self::Minutes => "min",
            Self::Kilometers => "km",
            Self::Miles => "mi",
            Self::LitersPerHour => "L/h",
            Self::GallonsPerHour => "gal/h",
            Self::Ratio => "λ",
            Self::Count => "",
            Self::None => "",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A numeric value with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: Unit,
}

impl Measurement {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Convert into the requested measurement system.
    ///
    /// Units without an imperial counterpart are returned unchanged.
    pub fn in_system(self, system: MeasurementSystem) -> Self {
        use Unit::*;
        match (system, self.unit) {
            (MeasurementSystem::Imperial, KilometersPerHour) => {
                Self::new(self.value * 0.621_371, MilesPerHour)
            }
            (MeasurementSystem::Imperial, Kilometers) => Self::new(self.value * 0.621_371, Miles),
            (MeasurementSystem::Imperial, Celsius) => {
                Self::new(self.value * 9.0 / 5.0 + 32.0, Fahrenheit)
            }
            (MeasurementSystem::Imperial, Kilopascal) => Self::new(self.value * 0.145_038, Psi),
            (MeasurementSystem::Imperial, LitersPerHour) => {
                Self::new(self.value * 0.264_172, GallonsPerHour)
            }
            (MeasurementSystem::Metric, MilesPerHour) => {
                Self::new(self.value / 0.621_371, KilometersPerHour)
            }
            (MeasurementSystem::Metric, Miles) => Self::new(self.value / 0.621_371, Kilometers),
            (MeasurementSystem::Metric, Fahrenheit) => {
                Self::new((self.value - 32.0) * 5.0 / 9.0, Celsius)
            }
            (MeasurementSystem::Metric, Psi) => Self::new(self.value / 0.145_038, Kilopascal),
            (MeasurementSystem::Metric, GallonsPerHour) => {
                Self::new(self.value / 0.264_172, LitersPerHour)
            }
            _ => self,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Unit::Count | Unit::None => write!(f, "{}", self.value),
            unit => write!(f, "{} {}", self.value, unit),
        }
    }
}

/// One named bit of a readiness or support bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub name: String,
    pub set: bool,
}

impl Flag {
    pub fn new(name: impl Into<String>, set: bool) -> Self {
        Self {
            name: name.into(),
            set,
        }
    }
}

/// Monitor status since DTCs were cleared (mode 01 PID 01).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessStatus {
    /// Malfunction indicator lamp (check engine light).
    pub mil_on: bool,
    /// Number of confirmed emissions-related DTCs.
    pub dtc_count: u8,
    /// Diesel (compression ignition) monitor set instead of spark ignition.
    pub compression_ignition: bool,
    /// `"<monitor> available"` / `"<monitor> incomplete"` flags, one per bit.
    pub monitors: Vec<Flag>,
}

/// One on-board monitor test result (mode 06).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTest {
    pub test_id: u8,
    pub unit_scaling: u8,
    pub value: u16,
    pub min: u16,
    pub max: u16,
    pub passed: bool,
}

/// Result of decoding one command's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DecodeResult {
    Value(Measurement),
    Flags(Vec<Flag>),
    Readiness(ReadinessStatus),
    Text(String),
    MonitorTests(Vec<MonitorTest>),
}

impl DecodeResult {
    /// Numeric value, if this result is a measurement.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(m) => Some(m.value),
            _ => None,
        }
    }

    /// Look up a flag by name in a flag set.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self {
            Self::Flags(flags) => flags.iter().find(|f| f.name == name).map(|f| f.set),
            Self::Readiness(r) => r.monitors.iter().find(|f| f.name == name).map(|f| f.set),
            _ => None,
        }
    }

    pub fn in_system(self, system: MeasurementSystem) -> Self {
        match self {
            Self::Value(m) => Self::Value(m.in_system(system)),
            other => other,
        }
    }
}

impl fmt::Display for DecodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(m) => write!(f, "{m}"),
            Self::Flags(flags) => {
                let set: Vec<&str> = flags
                    .iter()
                    .filter(|fl| fl.set)
                    .map(|fl| fl.name.as_str())
                    .collect();
                write!(f, "[{}]", set.join(", "))
            }
            Self::Readiness(r) => write!(
                f,
                "MIL {}, {} DTC(s)",
                if r.mil_on { "on" } else { "off" },
                r.dtc_count
            ),
            Self::Text(s) => f.write_str(s),
            Self::MonitorTests(tests) => {
                let failed = tests.iter().filter(|t| !t.passed).count();
                write!(f, "{} test(s), {failed} failed", tests.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imperial_conversions() {
        let speed = Measurement::new(100.0, Unit::KilometersPerHour).in_system(MeasurementSystem::Imperial);
        assert_eq!(speed.unit, Unit::MilesPerHour);
        assert!((speed.value - 62.1371).abs() < 0.001);

        let temp = Measurement::new(50.0, Unit::Celsius).in_system(MeasurementSystem::Imperial);
        assert_eq!(temp.unit, Unit::Fahrenheit);
        assert!((temp.value - 122.0).abs() < 0.001);
    }

    #[test]
    fn metric_is_identity_for_metric_units() {
        let rpm = Measurement::new(1654.0, Unit::Rpm);
        assert_eq!(rpm.in_system(MeasurementSystem::Metric), rpm);
        assert_eq!(rpm.in_system(MeasurementSystem::Imperial), rpm);
    }

    #[test]
    fn flag_lookup() {
        let result = DecodeResult::Flags(vec![Flag::new("PID 0C", true), Flag::new("PID 0D", false)]);
        assert_eq!(result.flag("PID 0C"), Some(true));
        assert_eq!(result.flag("PID 0D"), Some(false));
        assert_eq!(result.flag("PID 0E"), None);
        assert_eq!(result.value(), None);
    }

    #[test]
    fn decode_result_serialization() {
        let result = DecodeResult::Value(Measurement::new(50.0, Unit::Celsius));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "value");
        assert_eq!(json["data"]["unit"], "celsius");
        assert_eq!(json["data"]["value"], 50.0);
    }

    #[test]
    fn display_includes_unit() {
        assert_eq!(Measurement::new(60.0, Unit::KilometersPerHour).to_string(), "60 km/h");
        assert_eq!(Measurement::new(3.0, Unit::Count).to_string(), "3");
    }
}
