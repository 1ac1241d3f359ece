//! Adapter reply parsing and ISO-TP reassembly (receive-only).
//!
//! Turns the raw lines of one exchange into one payload per answering ECU.
//! The adapter paces consecutive frames itself, so no flow-control frames
//! are ever emitted here.

use std::collections::{BTreeMap, BTreeSet};

use elm_protocol::ObdProtocol;

use crate::error::FrameAssemblyError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Status lines
// ---------------------------------------------------------------------------

/// ELM327 status and informational lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Ok,
    /// `?`: the adapter did not understand the command.
    Unknown,
    NoData,
    Searching,
    BusInit,
    UnableToConnect,
    CanError,
    BusError,
    DataError,
    Stopped,
    BufferFull,
    /// Identification banner printed after a reset (`ELM327 v1.5`).
    Banner(String),
}

impl AdapterStatus {
    /// Statuses meaning the request never reached (or never came back from)
    /// the vehicle bus.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Unknown
                | Self::UnableToConnect
                | Self::CanError
                | Self::BusError
                | Self::DataError
                | Self::Stopped
                | Self::BufferFull
        )
    }
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Ok => "OK",
            Self::Unknown => "?",
            Self::NoData => "NO DATA",
            Self::Searching => "SEARCHING...",
            Self::BusInit => "BUS INIT",
            Self::UnableToConnect => "UNABLE TO CONNECT",
            Self::CanError => "CAN ERROR",
            Self::BusError => "BUS ERROR",
            Self::DataError => "DATA ERROR",
            Self::Stopped => "STOPPED",
            Self::BufferFull => "BUFFER FULL",
            Self::Banner(banner) => banner,
        };
        f.write_str(text)
    }
}

/// One reply line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    Status(AdapterStatus),
    Data(&'a str),
}

/// Classify a reply line as an adapter status or frame data.
pub fn classify_line(line: &str) -> ReplyLine<'_> {
    let trimmed = line.trim();
    let upper = trimmed.to_ascii_uppercase();
    let status = match upper.as_str() {
        "OK" => AdapterStatus::Ok,
        "?" => AdapterStatus::Unknown,
        "NO DATA" | "NODATA" => AdapterStatus::NoData,
        "STOPPED" => AdapterStatus::Stopped,
        "BUFFER FULL" => AdapterStatus::BufferFull,
        "CAN ERROR" => AdapterStatus::CanError,
        s if s.starts_with("SEARCHING") => AdapterStatus::Searching,
        s if s.starts_with("BUS INIT") => AdapterStatus::BusInit,
        s if s.starts_with("UNABLE TO CONNECT") => AdapterStatus::UnableToConnect,
        s if s.starts_with("BUS ERROR") || s.starts_with("BUS BUSY") => AdapterStatus::BusError,
        s if s.contains("DATA ERROR") || s.contains("RX ERROR") => AdapterStatus::DataError,
        s if s.starts_with("ELM327") => AdapterStatus::Banner(trimmed.to_string()),
        _ => return ReplyLine::Data(trimmed),
    };
    ReplyLine::Status(status)
}

// ---------------------------------------------------------------------------
// Header layouts
// ---------------------------------------------------------------------------

/// How response lines are prefixed, by bus protocol and header setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// 11-bit CAN: 3 hex digit arbitration ID, then PCI.
    Can11,
    /// 29-bit CAN: 4 header bytes, then PCI.
    Can29,
    /// J1850 / ISO 9141 / KWP: priority, target, source bytes, payload,
    /// trailing checksum. No PCI; every line is a complete message.
    Legacy,
    /// Headers disabled. Lines carry no ECU id.
    Headerless,
}

impl FrameLayout {
    pub fn for_protocol(protocol: ObdProtocol, headers: bool) -> Self {
        if !headers {
            FrameLayout::Headerless
        } else if protocol.is_extended_can() {
            FrameLayout::Can29
        } else if protocol.is_can() || protocol == ObdProtocol::Auto {
            FrameLayout::Can11
        } else {
            FrameLayout::Legacy
        }
    }
}

fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// One data line after header stripping, before PCI interpretation.
enum RawLine {
    /// Bytes starting at the PCI byte.
    Pci(Vec<u8>),
    /// A complete payload without PCI (legacy buses, headerless single frames).
    Complete(Vec<u8>),
    /// Headerless multi-frame length line (`014`).
    Length(usize),
    /// Headerless multi-frame indexed line (`0: 49 02 01 ...`).
    Indexed { seq: u8, payload: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Per-ECU accumulator for a segmented message.
#[derive(Debug)]
struct ReassemblyBuffer {
    target: usize,
    data: Vec<u8>,
    next_seq: u8,
}

impl ReassemblyBuffer {
    fn is_complete(&self) -> bool {
        self.data.len() >= self.target
    }
}

/// Result of assembling one exchange.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssemblyOutcome {
    /// Completed payloads ordered by ECU id, then arrival.
    pub messages: Vec<ReassembledMessage>,
    /// Per-ECU failures. Siblings listed in `messages` are unaffected.
    pub errors: Vec<(EcuId, FrameAssemblyError)>,
    /// Status lines seen, excluding `SEARCHING...`/`BUS INIT`.
    pub statuses: Vec<AdapterStatus>,
    /// The adapter printed `NO DATA`.
    pub no_data: bool,
}

impl AssemblyOutcome {
    /// First status that means the bus request failed.
    pub fn failure(&self) -> Option<&AdapterStatus> {
        self.statuses.iter().find(|s| s.is_failure())
    }
}

/// Parses raw adapter lines into per-ECU reassembled payloads.
#[derive(Debug, Clone, Copy)]
pub struct FrameAssembler {
    layout: FrameLayout,
    default_ecu_id: EcuId,
}

impl FrameAssembler {
    pub fn new(layout: FrameLayout, default_ecu_id: EcuId) -> Self {
        Self {
            layout,
            default_ecu_id,
        }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Split one data line into its ECU id and the remaining content.
    fn split_line(&self, line: &str) -> Result<(EcuId, RawLine), (EcuId, FrameAssemblyError)> {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        let malformed = |ecu| (ecu, FrameAssemblyError::MalformedLine(line.to_string()));

        match self.layout {
            FrameLayout::Can11 => {
                let (id, rest) = compact
                    .split_at_checked(3)
                    .ok_or_else(|| malformed(self.default_ecu_id))?;
                let ecu = u32::from_str_radix(id, 16).map_err(|_| malformed(self.default_ecu_id))?;
                let bytes = parse_hex(rest).filter(|b| !b.is_empty()).ok_or_else(|| malformed(ecu))?;
                Ok((ecu, RawLine::Pci(bytes)))
            }
            FrameLayout::Can29 => {
                let bytes = parse_hex(&compact).ok_or_else(|| malformed(self.default_ecu_id))?;
                if bytes.len() < 5 {
                    return Err(malformed(self.default_ecu_id));
                }
                let ecu = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok((ecu, RawLine::Pci(bytes[4..].to_vec())))
            }
            FrameLayout::Legacy => {
                let bytes = parse_hex(&compact).ok_or_else(|| malformed(self.default_ecu_id))?;
                // priority, target, source, at least one data byte, checksum
                if bytes.len() < 5 {
                    return Err(malformed(self.default_ecu_id));
                }
                let ecu = u32::from(bytes[2]);
                Ok((ecu, RawLine::Complete(bytes[3..bytes.len() - 1].to_vec())))
            }
            FrameLayout::Headerless => {
                let ecu = self.default_ecu_id;
                if let Some((index, rest)) = compact.split_once(':') {
                    let seq = u8::from_str_radix(index, 16).map_err(|_| malformed(ecu))?;
                    let payload = parse_hex(rest).ok_or_else(|| malformed(ecu))?;
                    return Ok((ecu, RawLine::Indexed { seq: seq & 0x0F, payload }));
                }
                if compact.len() == 3 {
                    let total = usize::from_str_radix(&compact, 16).map_err(|_| malformed(ecu))?;
                    return Ok((ecu, RawLine::Length(total)));
                }
                let bytes = parse_hex(&compact).filter(|b| !b.is_empty()).ok_or_else(|| malformed(ecu))?;
                match bytes[0] >> 4 {
                    ISOTP_SF | ISOTP_FF | ISOTP_CF => Ok((ecu, RawLine::Pci(bytes))),
                    _ => Ok((ecu, RawLine::Complete(bytes))),
                }
            }
        }
    }

    /// Interpret a PCI-prefixed line.
    fn parse_pci(bytes: &[u8]) -> Result<CanFrame, FrameAssemblyError> {
        let malformed = || FrameAssemblyError::MalformedLine(hex_bytes(bytes));
        let first = *bytes.first().ok_or_else(malformed)?;
        match first >> 4 {
            ISOTP_SF => {
                let len = usize::from(first & 0x0F);
                if len == 0 {
                    return Err(malformed());
                }
                let available = bytes.len() - 1;
                if available < len {
                    return Err(FrameAssemblyError::Truncated {
                        expected: len,
                        got: available,
                    });
                }
                Ok(CanFrame {
                    arbitration_id: None,
                    pci: Pci::Single { len },
                    payload: bytes[1..=len].to_vec(),
                })
            }
            ISOTP_FF => {
                let second = *bytes.get(1).ok_or_else(malformed)?;
                let short = (usize::from(first & 0x0F) << 8) | usize::from(second);
                let (total, start) = if short == 0 {
                    // 32-bit length escape
                    let wide = bytes.get(2..6).ok_or_else(malformed)?;
                    let total = u32::from_be_bytes([wide[0], wide[1], wide[2], wide[3]]);
                    (total as usize, 6)
                } else {
                    (short, 2)
                };
                Ok(CanFrame {
                    arbitration_id: None,
                    pci: Pci::First { total },
                    payload: bytes[start..].to_vec(),
                })
            }
            ISOTP_CF => Ok(CanFrame {
                arbitration_id: None,
                pci: Pci::Consecutive { seq: first & 0x0F },
                payload: bytes[1..].to_vec(),
            }),
            _ => Err(malformed()),
        }
    }

    /// Assemble the lines of one exchange.
    pub fn assemble<S: AsRef<str>>(&self, lines: &[S]) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();
        let mut buffers: BTreeMap<EcuId, ReassemblyBuffer> = BTreeMap::new();
        let mut failed: BTreeSet<EcuId> = BTreeSet::new();

        for line in lines {
            let data = match classify_line(line.as_ref()) {
                ReplyLine::Status(AdapterStatus::NoData) => {
                    outcome.no_data = true;
                    continue;
                }
                ReplyLine::Status(AdapterStatus::Searching | AdapterStatus::BusInit) => continue,
                ReplyLine::Status(status) => {
                    outcome.statuses.push(status);
                    continue;
                }
                ReplyLine::Data(data) => data,
            };

            let (ecu, raw) = match self.split_line(data) {
                Ok(split) => split,
                Err((ecu, err)) => {
                    record_error(&mut outcome, &mut failed, ecu, err);
                    continue;
                }
            };

            let frame = match raw {
                RawLine::Complete(payload) => {
                    outcome.messages.push(ReassembledMessage::new(ecu, payload));
                    continue;
                }
                RawLine::Length(total) => CanFrame {
                    arbitration_id: Some(ecu),
                    pci: Pci::First { total },
                    payload: Vec::new(),
                },
                RawLine::Indexed { seq, payload } => CanFrame {
                    arbitration_id: Some(ecu),
                    pci: Pci::Consecutive { seq },
                    payload,
                },
                RawLine::Pci(bytes) => match Self::parse_pci(&bytes) {
                    Ok(frame) => CanFrame {
                        arbitration_id: Some(ecu),
                        ..frame
                    },
                    Err(err) => {
                        buffers.remove(&ecu);
                        record_error(&mut outcome, &mut failed, ecu, err);
                        continue;
                    }
                },
            };
            let headerless_index = matches!(
                (self.layout, &frame.pci),
                (FrameLayout::Headerless, Pci::First { .. }) if frame.payload.is_empty()
            );

            match frame.pci {
                Pci::Single { .. } => {
                    outcome.messages.push(ReassembledMessage::new(ecu, frame.payload));
                }
                Pci::First { total } => {
                    failed.remove(&ecu);
                    if buffers.contains_key(&ecu) {
                        record_error(&mut outcome, &mut failed, ecu, FrameAssemblyError::Superseded);
                        failed.remove(&ecu);
                    }
                    let buffer = ReassemblyBuffer {
                        target: total,
                        data: frame.payload,
                        // Indexed headerless lines count from 0.
                        next_seq: if headerless_index { 0 } else { 1 },
                    };
                    if buffer.is_complete() && !headerless_index {
                        outcome.messages.push(complete(ecu, buffer));
                    } else {
                        buffers.insert(ecu, buffer);
                    }
                }
                Pci::Consecutive { seq } => {
                    let Some(buffer) = buffers.get_mut(&ecu) else {
                        if !failed.contains(&ecu) {
                            record_error(
                                &mut outcome,
                                &mut failed,
                                ecu,
                                FrameAssemblyError::UnexpectedConsecutive,
                            );
                        }
                        continue;
                    };
                    if seq != buffer.next_seq {
                        let expected = buffer.next_seq;
                        buffers.remove(&ecu);
                        record_error(
                            &mut outcome,
                            &mut failed,
                            ecu,
                            FrameAssemblyError::SequenceMismatch { expected, got: seq },
                        );
                        continue;
                    }
                    buffer.data.extend_from_slice(&frame.payload);
                    buffer.next_seq = (buffer.next_seq + 1) & 0x0F;
                    if buffer.is_complete() {
                        if let Some(buffer) = buffers.remove(&ecu) {
                            outcome.messages.push(complete(ecu, buffer));
                        }
                    }
                }
            }
        }

        for (ecu, buffer) in buffers {
            record_error(
                &mut outcome,
                &mut failed,
                ecu,
                FrameAssemblyError::Truncated {
                    expected: buffer.target,
                    got: buffer.data.len(),
                },
            );
        }

        outcome.messages.sort_by_key(|m| m.ecu_id);
        outcome
    }
}

fn complete(ecu: EcuId, mut buffer: ReassemblyBuffer) -> ReassembledMessage {
    buffer.data.truncate(buffer.target);
    ReassembledMessage::new(ecu, buffer.data)
}

fn record_error(
    outcome: &mut AssemblyOutcome,
    failed: &mut BTreeSet<EcuId>,
    ecu: EcuId,
    err: FrameAssemblyError,
) {
    tracing::warn!(ecu = %format_args!("0x{ecu:X}"), error = %err, "dropping ECU message");
    failed.insert(ecu);
    outcome.errors.push((ecu, err));
}

/// Split `payload` into ISO-TP lines as an adapter with 11-bit headers prints
/// them. Used to script mock replies.
pub fn segment_can11(ecu: EcuId, payload: &[u8]) -> Vec<String> {
    let line = |bytes: &[u8]| format!("{ecu:03X} {}", hex_bytes(bytes));
    if payload.len() <= 7 {
        let mut frame = vec![payload.len() as u8];
        frame.extend_from_slice(payload);
        return vec![line(&frame)];
    }
    let total = payload.len();
    let mut lines = Vec::new();
    let mut first = vec![0x10 | ((total >> 8) as u8 & 0x0F), total as u8];
    first.extend_from_slice(&payload[..6]);
    lines.push(line(&first));
    for (i, chunk) in payload[6..].chunks(7).enumerate() {
        let mut frame = vec![0x20 | ((i + 1) as u8 & 0x0F)];
        frame.extend_from_slice(chunk);
        lines.push(line(&frame));
    }
    lines
}
