//! PID value decoders.
//!
//! Every decoder receives the payload with the response SID and echoed PID
//! byte(s) already stripped.

use elm_protocol::{DecodeResult, Flag, Measurement, MonitorTest, ReadinessStatus, Unit};

use crate::error::DecodeError;

/// How a command's data bytes become a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoder {
    /// `raw × scale + offset`, where `raw` is the big-endian integer in the
    /// leading `width` bytes.
    Linear {
        width: u8,
        scale: f64,
        offset: f64,
        signed: bool,
        unit: Unit,
    },
    /// Supported-PID bitmap covering `base + 1 ..= base + 32`.
    SupportBitmap { base: u8 },
    /// Monitor status (mode 01 PIDs 01 and 41).
    Readiness,
    /// Fuel system 1/2 loop status (mode 01 PID 03).
    FuelSystemStatus,
    /// First byte mapped through a value table.
    Enumerated(&'static [(u8, &'static str)]),
    /// Bits of the first byte, least significant first.
    NamedBits(&'static [&'static str]),
    /// Printable ASCII after skipping `skip` leading bytes.
    Ascii { skip: usize },
    /// Mode 06 test records.
    MonitorTests,
}

impl Decoder {
    pub fn linear(width: u8, scale: f64, offset: f64, unit: Unit) -> Self {
        Decoder::Linear {
            width,
            scale,
            offset,
            signed: false,
            unit,
        }
    }

    /// `A × 100 / 255`.
    pub fn percent() -> Self {
        Self::linear(1, 100.0 / 255.0, 0.0, Unit::Percent)
    }

    /// `A − 40` °C.
    pub fn temperature() -> Self {
        Self::linear(1, 1.0, -40.0, Unit::Celsius)
    }

    /// `(A − 128) × 100 / 128`.
    pub fn trim() -> Self {
        Self::linear(1, 100.0 / 128.0, -100.0, Unit::Percent)
    }

    /// Minimum number of data bytes this decoder reads.
    pub fn min_len(&self) -> usize {
        match self {
            Decoder::Linear { width, .. } => usize::from(*width),
            Decoder::SupportBitmap { .. } | Decoder::Readiness => 4,
            Decoder::FuelSystemStatus
            | Decoder::Enumerated(_)
            | Decoder::NamedBits(_) => 1,
            Decoder::Ascii { skip } => skip + 1,
            Decoder::MonitorTests => 8,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<DecodeResult, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::NoData);
        }
        let need = self.min_len();
        if data.len() < need {
            return Err(DecodeError::InsufficientLength {
                expected: need,
                got: data.len(),
            });
        }

        match self {
            Decoder::Linear {
                width,
                scale,
                offset,
                signed,
                unit,
            } => {
                let raw = read_be(&data[..usize::from(*width)], *signed);
                Ok(DecodeResult::Value(Measurement::new(raw * scale + offset, *unit)))
            }
            Decoder::SupportBitmap { base } => Ok(DecodeResult::Flags(
                (0..32u8)
                    .map(|bit| {
                        let pid = base.wrapping_add(bit + 1);
                        Flag::new(format!("PID {pid:02X}"), bitmap_bit(data, bit))
                    })
                    .collect(),
            )),
            Decoder::Readiness => Ok(DecodeResult::Readiness(readiness(data))),
            Decoder::FuelSystemStatus => {
                let mut text = fuel_loop(data[0]).to_string();
                if let Some(&second) = data.get(1).filter(|b| **b != 0) {
                    text = format!("{text}; system 2: {}", fuel_loop(second));
                }
                Ok(DecodeResult::Text(text))
            }
            Decoder::Enumerated(table) => {
                let value = data[0];
                let text = table
                    .iter()
                    .find(|(v, _)| *v == value)
                    .map(|(_, name)| name.to_string())
                    .unwrap_or_else(|| format!("unknown (0x{value:02X})"));
                Ok(DecodeResult::Text(text))
            }
            Decoder::NamedBits(names) => Ok(DecodeResult::Flags(
                names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Flag::new(*name, data[0] & (1 << i) != 0))
                    .collect(),
            )),
            Decoder::Ascii { skip } => {
                let text: String = data[*skip..]
                    .iter()
                    .filter(|b| b.is_ascii_graphic() || **b == b' ')
                    .map(|b| char::from(*b))
                    .collect();
                Ok(DecodeResult::Text(text.trim().to_string()))
            }
            Decoder::MonitorTests => Ok(DecodeResult::MonitorTests(monitor_tests(data))),
        }
    }
}

fn read_be(bytes: &[u8], signed: bool) -> f64 {
    let raw = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    if signed && !bytes.is_empty() {
        let bits = bytes.len() * 8;
        let shift = 64 - bits;
        (((raw << shift) as i64) >> shift) as f64
    } else {
        raw as f64
    }
}

/// Bit `n` of a support bitmap, MSB of the first byte being bit 0.
fn bitmap_bit(data: &[u8], n: u8) -> bool {
    let byte = data[usize::from(n / 8)];
    byte & (0x80 >> (n % 8)) != 0
}

/// PIDs marked supported in a 4-byte support bitmap starting after `base`.
pub fn supported_pids(base: u8, data: &[u8]) -> Vec<u8> {
    if data.len() < 4 {
        return Vec::new();
    }
    (0..32u8)
        .filter(|bit| bitmap_bit(data, *bit))
        .map(|bit| base.wrapping_add(bit + 1))
        .collect()
}

fn fuel_loop(value: u8) -> &'static str {
    match value {
        0x00 => "motor off",
        0x01 => "open loop: insufficient engine temperature",
        0x02 => "closed loop",
        0x04 => "open loop: engine load or fuel cut",
        0x08 => "open loop: system failure",
        0x10 => "closed loop: feedback fault",
        _ => "invalid",
    }
}

const COMMON_MONITORS: [&str; 3] = ["misfire", "fuel system", "components"];

const SPARK_MONITORS: [&str; 8] = [
    "catalyst",
    "heated catalyst",
    "evaporative system",
    "secondary air system",
    "A/C refrigerant",
    "oxygen sensor",
    "oxygen sensor heater",
    "EGR system",
];

const COMPRESSION_MONITORS: [&str; 8] = [
    "NMHC catalyst",
    "NOx/SCR monitor",
    "reserved",
    "boost pressure",
    "reserved",
    "exhaust gas sensor",
    "PM filter",
    "EGR/VVT system",
];

fn readiness(data: &[u8]) -> ReadinessStatus {
    let (a, b, c, d) = (data[0], data[1], data[2], data[3]);
    let compression_ignition = b & 0x08 != 0;
    let mut monitors = Vec::new();

    for (i, name) in COMMON_MONITORS.iter().enumerate() {
        monitors.push(Flag::new(format!("{name} available"), b & (1 << i) != 0));
        monitors.push(Flag::new(format!("{name} incomplete"), b & (0x10 << i) != 0));
    }
    let specific = if compression_ignition {
        &COMPRESSION_MONITORS
    } else {
        &SPARK_MONITORS
    };
    for (i, name) in specific.iter().enumerate() {
        if *name == "reserved" {
            continue;
        }
        monitors.push(Flag::new(format!("{name} available"), c & (1 << i) != 0));
        monitors.push(Flag::new(format!("{name} incomplete"), d & (1 << i) != 0));
    }

    ReadinessStatus {
        mil_on: a & 0x80 != 0,
        dtc_count: a & 0x7F,
        compression_ignition,
        monitors,
    }
}

/// Test records: the first follows the stripped MID, later ones repeat it.
fn monitor_tests(data: &[u8]) -> Vec<MonitorTest> {
    let mut tests = Vec::new();
    let mut rest = data;
    while rest.len() >= 8 {
        let word = |i: usize| u16::from_be_bytes([rest[i], rest[i + 1]]);
        let (value, min, max) = (word(2), word(4), word(6));
        tests.push(MonitorTest {
            test_id: rest[0],
            unit_scaling: rest[1],
            value,
            min,
            max,
            passed: (min..=max).contains(&value),
        });
        rest = &rest[8..];
        if rest.len() >= 9 {
            rest = &rest[1..];
        } else {
            break;
        }
    }
    tests
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(decoder: &Decoder, data: &[u8]) -> f64 {
        decoder.decode(data).unwrap().value().unwrap()
    }

    #[test]
    fn rpm_formula() {
        let rpm = Decoder::linear(2, 0.25, 0.0, Unit::Rpm);
        assert_eq!(value(&rpm, &[0x1A, 0xF8]), 1654.0);
    }

    #[test]
    fn coolant_temperature() {
        assert_eq!(value(&Decoder::temperature(), &[0x5A]), 50.0);
        assert_eq!(value(&Decoder::temperature(), &[0x00]), -40.0);
    }

    #[test]
    fn load_and_trim() {
        assert!((value(&Decoder::percent(), &[0xFF]) - 100.0).abs() < 1e-9);
        assert_eq!(value(&Decoder::trim(), &[0x80]), 0.0);
        assert_eq!(value(&Decoder::trim(), &[0x00]), -100.0);
    }

    #[test]
    fn signed_linear() {
        let vapor = Decoder::Linear {
            width: 2,
            scale: 0.25,
            offset: 0.0,
            signed: true,
            unit: Unit::Pascal,
        };
        assert_eq!(value(&vapor, &[0xFF, 0xFC]), -1.0);
        assert_eq!(value(&vapor, &[0x00, 0x04]), 1.0);
    }

    #[test]
    fn short_payload_is_not_fatal() {
        let rpm = Decoder::linear(2, 0.25, 0.0, Unit::Rpm);
        assert_eq!(
            rpm.decode(&[0x1A]),
            Err(DecodeError::InsufficientLength { expected: 2, got: 1 })
        );
        assert_eq!(rpm.decode(&[]), Err(DecodeError::NoData));
    }

    #[test]
    fn support_bitmap_flags() {
        let result = Decoder::SupportBitmap { base: 0x00 }
            .decode(&[0xBE, 0x1F, 0xA8, 0x13])
            .unwrap();
        assert_eq!(result.flag("PID 01"), Some(true));
        assert_eq!(result.flag("PID 02"), Some(false));
        assert_eq!(result.flag("PID 0C"), Some(true));
        assert_eq!(result.flag("PID 20"), Some(true));
        assert_eq!(result.value(), None);
    }

    #[test]
    fn supported_pid_list() {
        let pids = supported_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x0D));
        assert!(pids.contains(&0x20));
        assert!(!pids.contains(&0x02));
        assert_eq!(supported_pids(0x20, &[0x80, 0, 0, 0]), vec![0x21]);
    }

    #[test]
    fn readiness_decodes_mil_and_monitors() {
        let result = Decoder::Readiness.decode(&[0x83, 0x07, 0x65, 0x04]).unwrap();
        let DecodeResult::Readiness(status) = &result else {
            panic!("expected readiness, got {result:?}");
        };
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 3);
        assert!(!status.compression_ignition);
        assert_eq!(result.flag("misfire available"), Some(true));
        assert_eq!(result.flag("misfire incomplete"), Some(false));
        assert_eq!(result.flag("catalyst available"), Some(true));
        assert_eq!(result.flag("evaporative system incomplete"), Some(true));
    }

    #[test]
    fn fuel_system_text() {
        let result = Decoder::FuelSystemStatus.decode(&[0x02, 0x00]).unwrap();
        assert_eq!(result, DecodeResult::Text("closed loop".into()));
    }

    #[test]
    fn ascii_vin() {
        let mut data = vec![0x01];
        data.extend_from_slice(b"1D4GP00R55B123456");
        let result = Decoder::Ascii { skip: 1 }.decode(&data).unwrap();
        assert_eq!(result, DecodeResult::Text("1D4GP00R55B123456".into()));
    }

    #[test]
    fn monitor_test_records() {
        // TID 0B, UASID 24, value 0x0010, min 0x0000, max 0x0020,
        // then MID 01 repeated, TID 0C failing its range.
        let data = [
            0x0B, 0x24, 0x00, 0x10, 0x00, 0x00, 0x00, 0x20, //
            0x01, 0x0C, 0x24, 0x00, 0x30, 0x00, 0x00, 0x00, 0x20,
        ];
        let result = Decoder::MonitorTests.decode(&data).unwrap();
        let DecodeResult::MonitorTests(tests) = result else {
            panic!("expected monitor tests");
        };
        assert_eq!(tests.len(), 2);
        assert!(tests[0].passed);
        assert_eq!(tests[1].test_id, 0x0C);
        assert!(!tests[1].passed);
    }
}
