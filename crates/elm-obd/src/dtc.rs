//! Trouble-code byte-pair codec.
//!
//! Two bytes per code: the top two bits of A select P/C/B/U, the next two
//! bits are the first digit (0–3), the low nibble of A the second digit, and
//! B the last two digits. `00 00` is padding.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::LazyLock;

use elm_protocol::{DtcCategory, DtcKind};
use regex::Regex;

use crate::error::{DecodeError, DtcCodecError};
use crate::types::*;

static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[PCBU][0-3][0-9A-F]{3}$").unwrap());

/// Codes read per ECU; a failed ECU never hides its siblings' codes.
pub type CodesByEcu = BTreeMap<EcuId, Result<Vec<String>, DecodeError>>;

pub struct TroubleCodeCodec;

impl TroubleCodeCodec {
    /// Pack a code such as `"P0302"` into its byte pair.
    pub fn encode(code: &str) -> Result<[u8; 2], DtcCodecError> {
        let upper = code.trim().to_ascii_uppercase();
        if !CODE_PATTERN.is_match(&upper) {
            return Err(DtcCodecError(code.to_string()));
        }
        let category = DtcCategory::from_code(&upper).ok_or_else(|| DtcCodecError(code.to_string()))?;
        let digits = u16::from_str_radix(&upper[1..], 16).map_err(|_| DtcCodecError(code.to_string()))?;
        let [hi, lo] = digits.to_be_bytes();
        Ok([(category.bits() << 6) | (hi & 0x3F), lo])
    }

    /// Inverse of [`encode`](Self::encode). `None` for padding.
    pub fn decode(a: u8, b: u8) -> Option<String> {
        if a == 0x00 && b == 0x00 {
            return None;
        }
        let category = DtcCategory::from_bits(a >> 6);
        let first = (a >> 4) & 0x03;
        let second = a & 0x0F;
        Some(format!("{}{first}{second:X}{b:02X}", category.letter()))
    }

    /// Decode consecutive byte pairs, skipping padding. A trailing odd byte
    /// is ignored.
    pub fn decode_pairs(data: &[u8]) -> Vec<String> {
        data.chunks_exact(2)
            .filter_map(|pair| Self::decode(pair[0], pair[1]))
            .collect()
    }

    /// Decode one ECU's reply to a mode 03/07/0A request.
    ///
    /// CAN replies carry a count byte after the SID, which makes the data
    /// length odd; legacy-bus lines carry pairs only.
    pub fn decode_payload(kind: DtcKind, payload: &[u8]) -> Result<Vec<String>, DecodeError> {
        let service = kind.service();
        let (&sid, data) = payload.split_first().ok_or(DecodeError::NoData)?;
        if sid == NEGATIVE_RESPONSE_SID {
            return Err(DecodeError::NegativeResponse {
                service,
                nrc: data.get(1).copied().unwrap_or(0),
            });
        }
        let expected = service + RESPONSE_SID_OFFSET;
        if sid != expected {
            return Err(DecodeError::WrongService { expected, got: sid });
        }
        let pairs = if data.len() % 2 == 1 { &data[1..] } else { data };
        Ok(Self::decode_pairs(pairs))
    }

    /// Group the codes in `messages` by responding ECU.
    pub fn decode_response(kind: DtcKind, messages: &[ReassembledMessage]) -> CodesByEcu {
        let mut grouped: CodesByEcu = BTreeMap::new();
        for message in messages {
            let decoded = Self::decode_payload(kind, &message.payload);
            match grouped.entry(message.ecu_id) {
                Entry::Vacant(slot) => {
                    slot.insert(decoded);
                }
                Entry::Occupied(mut slot) => {
                    let failed = match (slot.get_mut(), decoded) {
                        (Ok(codes), Ok(more)) => {
                            codes.extend(more);
                            None
                        }
                        (Ok(_), Err(err)) => Some(err),
                        (Err(_), _) => None,
                    };
                    if let Some(err) = failed {
                        slot.insert(Err(err));
                    }
                }
            }
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p0302_round_trip() {
        assert_eq!(TroubleCodeCodec::encode("P0302").unwrap(), [0x03, 0x02]);
        assert_eq!(TroubleCodeCodec::decode(0x03, 0x02).as_deref(), Some("P0302"));
    }

    #[test]
    fn padding_is_skipped() {
        assert_eq!(TroubleCodeCodec::decode(0x00, 0x00), None);
        let codes = TroubleCodeCodec::decode_pairs(&[0x03, 0x02, 0x00, 0x00, 0x01, 0x71]);
        assert_eq!(codes, vec!["P0302", "P0171"]);
    }

    #[test]
    fn categories_and_high_digits() {
        assert_eq!(TroubleCodeCodec::encode("C0035").unwrap(), [0x40, 0x35]);
        assert_eq!(TroubleCodeCodec::encode("B1318").unwrap(), [0x93, 0x18]);
        assert_eq!(TroubleCodeCodec::encode("U0100").unwrap(), [0xC1, 0x00]);
        assert_eq!(TroubleCodeCodec::encode("p0a80").unwrap(), [0x0A, 0x80]);
        assert_eq!(TroubleCodeCodec::decode(0x93, 0x18).as_deref(), Some("B1318"));
        assert_eq!(TroubleCodeCodec::decode(0xC1, 0x00).as_deref(), Some("U0100"));
        assert_eq!(TroubleCodeCodec::decode(0x0A, 0x80).as_deref(), Some("P0A80"));
    }

    #[test]
    fn invalid_codes_rejected() {
        for bad in ["", "P030", "X0302", "P4302", "P03022", "P03G2"] {
            assert!(TroubleCodeCodec::encode(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn can_payload_with_count_byte() {
        let codes = TroubleCodeCodec::decode_payload(
            DtcKind::Stored,
            &[0x43, 0x02, 0x03, 0x02, 0x01, 0x71],
        )
        .unwrap();
        assert_eq!(codes, vec!["P0302", "P0171"]);
    }

    #[test]
    fn legacy_payload_without_count_byte() {
        let codes = TroubleCodeCodec::decode_payload(
            DtcKind::Stored,
            &[0x43, 0x03, 0x02, 0x00, 0x00, 0x00, 0x00],
        )
        .unwrap();
        assert_eq!(codes, vec!["P0302"]);
    }

    #[test]
    fn pending_codes_use_service_07() {
        let codes =
            TroubleCodeCodec::decode_payload(DtcKind::Pending, &[0x47, 0x01, 0x04, 0x20]).unwrap();
        assert_eq!(codes, vec!["P0420"]);
        assert_eq!(
            TroubleCodeCodec::decode_payload(DtcKind::Pending, &[0x43, 0x00]),
            Err(DecodeError::WrongService { expected: 0x47, got: 0x43 })
        );
    }

    #[test]
    fn grouped_per_ecu() {
        let messages = vec![
            ReassembledMessage::new(0x7E8, vec![0x43, 0x01, 0x03, 0x02]),
            ReassembledMessage::new(0x7E9, vec![0x43, 0x00]),
            ReassembledMessage::new(0x7EA, vec![0x7F, 0x03, 0x22]),
        ];
        let grouped = TroubleCodeCodec::decode_response(DtcKind::Stored, &messages);
        assert_eq!(grouped[&0x7E8], Ok(vec!["P0302".to_string()]));
        assert_eq!(grouped[&0x7E9], Ok(vec![]));
        assert_eq!(
            grouped[&0x7EA],
            Err(DecodeError::NegativeResponse { service: 0x03, nrc: 0x22 })
        );
    }
}
