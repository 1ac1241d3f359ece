//! Response extraction: reassembled payloads to decoded values.
//!
//! Composite mode 01 requests are walked strictly by position. The values
//! come back in the order the PIDs were concatenated into the request, so a
//! caller must never reorder its PID list relative to the request string.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use elm_protocol::{DecodeResult, MeasurementSystem};
use serde::Serialize;

use crate::catalog::{CommandCatalog, CommandFamily, CommandKey};
use crate::error::{DecodeError, ObdError, ObdResult, ResponseError};
use crate::frame::AssemblyOutcome;
use crate::types::*;

/// Build a composite mode 01 request such as `"010C0D"`.
pub fn compose_request(pids: &[u8]) -> ObdResult<String> {
    if pids.is_empty() || pids.len() > MAX_BATCH_PIDS {
        return Err(ObdError::InvalidRequest(format!(
            "a composite request takes 1 to {MAX_BATCH_PIDS} PIDs, got {}",
            pids.len()
        )));
    }
    let mut request = format!("{MODE_CURRENT_DATA:02X}");
    for pid in pids {
        request.push_str(&format!("{pid:02X}"));
    }
    Ok(request)
}

/// One command's readings, one entry per answering ECU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub key: CommandKey,
    #[serde(serialize_with = "serialize_readings")]
    pub readings: BTreeMap<EcuId, Result<DecodeResult, ResponseError>>,
}

fn serialize_readings<S: serde::Serializer>(
    readings: &BTreeMap<EcuId, Result<DecodeResult, ResponseError>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(readings.len()))?;
    for (ecu, reading) in readings {
        let key = format!("0x{ecu:X}");
        match reading {
            Ok(value) => map.serialize_entry(&key, value)?,
            Err(err) => map.serialize_entry(&key, &serde_json::json!({ "error": err.to_string() }))?,
        }
    }
    map.end()
}

impl QueryResponse {
    pub fn new(key: CommandKey) -> Self {
        Self {
            key,
            readings: BTreeMap::new(),
        }
    }

    /// Record a reading. An ECU that answers twice keeps its first success.
    fn record(&mut self, ecu_id: EcuId, reading: Result<DecodeResult, ResponseError>) {
        match self.readings.entry(ecu_id) {
            Entry::Vacant(slot) => {
                slot.insert(reading);
            }
            Entry::Occupied(slot) => {
                let kept = slot.into_mut();
                if kept.is_err() && reading.is_ok() {
                    *kept = reading;
                }
            }
        }
    }

    /// Reading of the lowest ECU id that decoded successfully.
    pub fn primary(&self) -> Option<&DecodeResult> {
        self.readings.values().find_map(|r| r.as_ref().ok())
    }

    /// Numeric value of [`primary`](Self::primary).
    pub fn value(&self) -> Option<f64> {
        self.primary().and_then(DecodeResult::value)
    }

    /// First failure, if no ECU produced a value.
    pub fn failure(&self) -> Option<&ResponseError> {
        if self.primary().is_some() {
            return None;
        }
        self.readings.values().find_map(|r| r.as_ref().err())
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Decodes payloads against the catalog with a unit preference.
#[derive(Debug, Clone, Copy)]
pub struct ResponseExtractor<'a> {
    catalog: &'a CommandCatalog,
    system: MeasurementSystem,
    verify_pid_echo: bool,
}

impl<'a> ResponseExtractor<'a> {
    pub fn new(catalog: &'a CommandCatalog, system: MeasurementSystem, verify_pid_echo: bool) -> Self {
        Self {
            catalog,
            system,
            verify_pid_echo,
        }
    }

    /// Check the response SID of one ECU payload and return the bytes after it.
    fn strip_sid<'p>(service: u8, payload: &'p [u8]) -> Result<&'p [u8], DecodeError> {
        let (&sid, rest) = payload.split_first().ok_or(DecodeError::NoData)?;
        if sid == NEGATIVE_RESPONSE_SID {
            return Err(DecodeError::NegativeResponse {
                service,
                nrc: rest.get(1).copied().unwrap_or(0),
            });
        }
        let expected = service.wrapping_add(RESPONSE_SID_OFFSET);
        if sid != expected {
            return Err(DecodeError::WrongService { expected, got: sid });
        }
        Ok(rest)
    }

    /// Decode one ECU's reply to a single-command request.
    pub fn extract_single(&self, family: CommandFamily, payload: &[u8]) -> Result<DecodeResult, DecodeError> {
        let key = family.key();
        let command = self.catalog.family(family).ok_or(DecodeError::Unmappable {
            service: key.service,
            pid: key.pid,
        })?;
        let rest = Self::strip_sid(key.service, payload)?;
        let (echo, data) = rest.split_at_checked(family.echo_len()).unwrap_or((rest, &[]));
        if self.verify_pid_echo {
            if let Some(got) = family.echoed_pid(echo) {
                if got != key.pid {
                    return Err(DecodeError::PidMismatch { expected: key.pid, got });
                }
            }
        }
        command.decode(data).map(|r| r.in_system(self.system))
    }

    /// Decode one ECU's reply to a composite mode 01 request, returning one
    /// result per requested PID in request order.
    ///
    /// Once the walk loses its position (unknown PID length, echo mismatch
    /// in strict mode, payload exhausted) every remaining PID fails too.
    pub fn extract_batch(&self, pids: &[u8], payload: &[u8]) -> Vec<Result<DecodeResult, DecodeError>> {
        let mut rest = match Self::strip_sid(MODE_CURRENT_DATA, payload) {
            Ok(rest) => rest,
            Err(err) => return pids.iter().map(|_| Err(err.clone())).collect(),
        };

        let mut results = Vec::with_capacity(pids.len());
        let mut lost: Option<DecodeError> = None;
        for &pid in pids {
            if let Some(err) = &lost {
                results.push(Err(err.clone()));
                continue;
            }
            let result = self.take_pid(pid, &mut rest);
            if let Err(err) = &result {
                lost = Some(err.clone());
            }
            results.push(result);
        }
        results
    }

    /// Consume one `PID data...` group from the front of `rest`.
    fn take_pid(&self, pid: u8, rest: &mut &[u8]) -> Result<DecodeResult, DecodeError> {
        let command = self
            .catalog
            .family(CommandFamily::LiveData(pid))
            .ok_or(DecodeError::Unmappable {
                service: MODE_CURRENT_DATA,
                pid: pid.into(),
            })?;
        let (&echo, after) = rest.split_first().ok_or(DecodeError::NoData)?;
        if self.verify_pid_echo && echo != pid {
            return Err(DecodeError::PidMismatch {
                expected: pid.into(),
                got: echo.into(),
            });
        }
        let len = if command.length == 0 { after.len() } else { command.length };
        if after.len() < len {
            return Err(DecodeError::InsufficientLength {
                expected: len,
                got: after.len(),
            });
        }
        let (data, remaining) = after.split_at(len);
        *rest = remaining;
        command.decode(data).map(|r| r.in_system(self.system))
    }

    /// Build the response to a single-command request from an assembled
    /// exchange. Frame failures are kept per ECU next to the decoded values.
    pub fn single_response(&self, family: CommandFamily, outcome: &AssemblyOutcome) -> QueryResponse {
        let mut response = QueryResponse::new(family.key());
        for message in &outcome.messages {
            let reading = self
                .extract_single(family, &message.payload)
                .map_err(ResponseError::from);
            response.record(message.ecu_id, reading);
        }
        for (ecu_id, err) in &outcome.errors {
            response.record(*ecu_id, Err(err.clone().into()));
        }
        response
    }

    /// Build one response per requested PID, in request order.
    pub fn batch_responses(&self, pids: &[u8], outcome: &AssemblyOutcome) -> Vec<QueryResponse> {
        let mut responses: Vec<QueryResponse> = pids
            .iter()
            .map(|&pid| QueryResponse::new(CommandKey::live(pid)))
            .collect();
        for message in &outcome.messages {
            let results = self.extract_batch(pids, &message.payload);
            for (response, result) in responses.iter_mut().zip(results) {
                response.record(message.ecu_id, result.map_err(ResponseError::from));
            }
        }
        for (ecu_id, err) in &outcome.errors {
            for response in &mut responses {
                response.record(*ecu_id, Err(err.clone().into()));
            }
        }
        responses
    }
}
