//! Adapter session: handshake, protocol negotiation and vehicle requests.
//!
//! The session owns every piece of vehicle state (negotiated protocol,
//! answering ECUs, supported PIDs); nothing else mutates it. All exchanges
//! go through one pipe lock, so the transport never sees two overlapping
//! requests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use elm_protocol::{ConnectionState, DecodeResult, DtcKind, ObdProtocol, SessionEvent, TroubleCode};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::instrument;
use uuid::Uuid;

use crate::catalog::{CommandCatalog, CommandFamily, CommandKey};
use crate::config::SessionConfig;
use crate::decode::supported_pids;
use crate::dtc::TroubleCodeCodec;
use crate::dtc_db::DtcDatabase;
use crate::error::{
    DecodeError, ObdError, ObdResult, ResponseError, ScanError, TransportError, TransportResult,
};
use crate::extract::{QueryResponse, ResponseExtractor, compose_request};
use crate::frame::{AdapterStatus, AssemblyOutcome, FrameAssembler, FrameLayout, ReplyLine, classify_line};
use crate::transport::{LinkState, Transport};
use crate::types::*;

/// What negotiation learned about the vehicle. Fixed for the session's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleProfile {
    pub protocol: ObdProtocol,
    /// ECUs that answered the PID support query.
    pub ecus: BTreeSet<EcuId>,
    /// Mode 01 PIDs any ECU marked supported.
    pub supported_pids: BTreeSet<u8>,
}

impl VehicleProfile {
    fn new(protocol: ObdProtocol) -> Self {
        Self {
            protocol,
            ecus: BTreeSet::new(),
            supported_pids: BTreeSet::new(),
        }
    }

    /// PID 00 is always answerable once a vehicle is connected.
    pub fn supports(&self, pid: u8) -> bool {
        pid == 0x00 || self.supported_pids.contains(&pid)
    }
}

struct SessionInner {
    state: ConnectionState,
    vehicle: Option<VehicleProfile>,
    assembler: FrameAssembler,
    /// Bumped by every stop; an establish started under an older value
    /// must not promote the session.
    generation: u64,
}

/// Accepts any reply to `ATZ` except `?`; the banner text varies by clone.
fn accepts_reset(lines: &[String]) -> bool {
    !lines.is_empty()
        && !lines
            .iter()
            .any(|l| classify_line(l) == ReplyLine::Status(AdapterStatus::Unknown))
}

fn accepts_ok(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|l| classify_line(l) == ReplyLine::Status(AdapterStatus::Ok))
}

/// Data bytes of a positive reply to PID support query `base`.
fn support_bitmap(payload: &[u8], base: u8) -> Option<&[u8]> {
    match payload {
        [0x41, pid, bitmap @ ..] if *pid == base && bitmap.len() >= 4 => Some(&bitmap[..4]),
        _ => None,
    }
}

/// One ELM327 adapter and the vehicle behind it.
pub struct AdapterSession {
    id: Uuid,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    catalog: Arc<CommandCatalog>,
    dtc_db: Arc<DtcDatabase>,
    inner: RwLock<SessionInner>,
    /// Held for the duration of every exchange.
    pipe: Mutex<()>,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl AdapterSession {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let assembler = FrameAssembler::new(
            FrameLayout::for_protocol(config.protocol, config.headers),
            config.default_ecu_id,
        );
        Self {
            id: Uuid::now_v7(),
            transport,
            catalog: Arc::new(CommandCatalog::standard()),
            dtc_db: Arc::new(DtcDatabase::packaged().clone()),
            inner: RwLock::new(SessionInner {
                state: ConnectionState::Disconnected,
                vehicle: None,
                assembler,
                generation: 0,
            }),
            pipe: Mutex::new(()),
            events: None,
            config,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<CommandCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_dtc_database(mut self, dtc_db: Arc<DtcDatabase>) -> Self {
        self.dtc_db = dtc_db;
        self
    }

    /// Send state-change and discovery events to `events`. A full or closed
    /// channel drops the event; the session never waits on it.
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    pub fn state(&self) -> ConnectionState {
        self.read().state.clone()
    }

    pub fn vehicle(&self) -> Option<VehicleProfile> {
        self.read().vehicle.clone()
    }

    /// Whether `key` can be requested from the connected vehicle.
    pub fn is_supported(&self, key: CommandKey) -> bool {
        let inner = self.read();
        let Some(vehicle) = &inner.vehicle else {
            return false;
        };
        match CommandFamily::from_key(key) {
            Some(CommandFamily::LiveData(pid) | CommandFamily::FreezeFrame(pid)) => {
                vehicle.supports(pid) && self.catalog.get(key).is_some()
            }
            Some(_) => self.catalog.get(key).is_some(),
            None => false,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn extractor(&self) -> ResponseExtractor<'_> {
        ResponseExtractor::new(&self.catalog, self.config.measurement, self.config.verify_pid_echo)
    }

    // ── State machine ───────────────────────────────────────────

    /// Move to `next` if legal. Self-transitions are silently ignored.
    fn transition(&self, next: ConnectionState) -> bool {
        self.transition_within(None, next)
    }

    /// Like [`transition`](Self::transition), but refused once the session
    /// has been stopped since `generation`.
    fn transition_within(&self, generation: Option<u64>, next: ConnectionState) -> bool {
        let from = {
            let mut inner = self.write();
            if generation.is_some_and(|g| g != inner.generation) || inner.state == next {
                return false;
            }
            if !inner.state.can_transition_to(&next) {
                tracing::warn!(
                    session_id = %self.id,
                    from = %inner.state,
                    to = %next,
                    "illegal state transition ignored"
                );
                return false;
            }
            std::mem::replace(&mut inner.state, next.clone())
        };
        tracing::info!(session_id = %self.id, from = %from, to = %next, "session state changed");
        self.emit(SessionEvent::StateChanged {
            session_id: self.id,
            from,
            to: next,
            timestamp: Utc::now(),
        });
        true
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                tracing::debug!(session_id = %self.id, error = %e, "session event dropped");
            }
        }
    }

    /// Drop vehicle state and move to `Error`.
    fn fail(&self, reason: String) {
        self.write().vehicle = None;
        self.transition(ConnectionState::Error { reason });
    }

    /// Reconcile session state with the transport's link state.
    fn sync_link(&self) {
        let link = *self.transport.link_state().borrow();
        if link != LinkState::Connected && self.state().is_adapter_reachable() {
            tracing::warn!(session_id = %self.id, link = ?link, "transport link lost");
            self.fail(format!("transport link {link:?}"));
        }
    }

    fn require_adapter(&self) -> ObdResult<()> {
        self.sync_link();
        let state = self.state();
        if state.is_adapter_reachable() {
            Ok(())
        } else {
            Err(ObdError::NotReady { state })
        }
    }

    fn require_vehicle(&self) -> ObdResult<()> {
        self.sync_link();
        let state = self.state();
        if state.is_vehicle_ready() {
            Ok(())
        } else {
            Err(ObdError::NotReady { state })
        }
    }

    // ── Exchanges ───────────────────────────────────────────────

    /// One bounded exchange. Callers hold the pipe lock.
    async fn exchange(&self, command: &str) -> TransportResult<Vec<String>> {
        tracing::debug!(session_id = %self.id, command, "sending");
        let result = match tokio::time::timeout(self.config.command_timeout(), self.transport.send(command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: self.config.command_timeout_ms,
            }),
        };
        match &result {
            Ok(lines) => tracing::debug!(session_id = %self.id, command, reply = ?lines, "received"),
            Err(e) => tracing::debug!(session_id = %self.id, command, error = %e, "exchange failed"),
        }
        result
    }

    /// Send a vehicle request and assemble the reply.
    async fn request(&self, command: &str) -> ObdResult<AssemblyOutcome> {
        let result = {
            let _pipe = self.pipe.lock().await;
            self.exchange(command).await
        };
        let lines = match result {
            Ok(lines) => lines,
            Err(err) => {
                if matches!(err, TransportError::NotConnected | TransportError::Closed) {
                    self.fail(err.to_string());
                }
                return Err(err.into());
            }
        };
        let assembler = self.read().assembler;
        Ok(assembler.assemble(&lines))
    }

    /// Send a command as-is and return the reply lines. Needs the adapter,
    /// not necessarily a vehicle.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn send_raw(&self, command: &str) -> ObdResult<Vec<String>> {
        self.require_adapter()?;
        let _pipe = self.pipe.lock().await;
        Ok(self.exchange(command).await?)
    }

    // ── Establishment ───────────────────────────────────────────

    /// Connect, run the adapter handshake, negotiate a protocol and discover
    /// the vehicle. Any failure leaves the session in `Error` with the
    /// transport closed.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn establish(&self) -> ObdResult<VehicleProfile> {
        let _pipe = self.pipe.lock().await;
        let generation = self.read().generation;
        if self.state() != ConnectionState::Disconnected {
            self.transport.disconnect().await;
            self.write().vehicle = None;
            self.transition(ConnectionState::Disconnected);
        }
        self.transition_within(Some(generation), ConnectionState::Connecting);

        match self.bring_up(generation).await {
            Ok(profile) => {
                let current = {
                    let mut inner = self.write();
                    let current = inner.generation == generation;
                    if current {
                        inner.assembler = FrameAssembler::new(
                            FrameLayout::for_protocol(profile.protocol, self.config.headers),
                            self.config.default_ecu_id,
                        );
                        inner.vehicle = Some(profile.clone());
                    }
                    current
                };
                let promoted = current
                    && self.transition_within(
                        Some(generation),
                        ConnectionState::ConnectedToVehicle {
                            protocol: profile.protocol,
                        },
                    );
                if !promoted {
                    return Err(self.abandon("vehicle discovered").await);
                }
                tracing::info!(
                    session_id = %self.id,
                    protocol = %profile.protocol,
                    ecus = profile.ecus.len(),
                    supported_pids = profile.supported_pids.len(),
                    "vehicle connected"
                );
                self.emit(SessionEvent::VehicleDiscovered {
                    session_id: self.id,
                    protocol: profile.protocol,
                    ecus: profile.ecus.iter().copied().collect(),
                    supported_pids: profile.supported_pids.len(),
                    timestamp: Utc::now(),
                });
                Ok(profile)
            }
            Err(err) if self.read().generation != generation => {
                Err(self.abandon(&err.to_string()).await)
            }
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "session establishment failed");
                self.transport.disconnect().await;
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Wind down an establish overtaken by `stop_connection`.
    async fn abandon(&self, reached: &str) -> ObdError {
        tracing::info!(session_id = %self.id, reached, "connection stopped during establishment");
        self.transport.disconnect().await;
        self.transition(ConnectionState::Disconnected);
        ObdError::Stopped
    }

    async fn bring_up(&self, generation: u64) -> ObdResult<VehicleProfile> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.connect(timeout)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    timeout_ms: self.config.connect_timeout_ms,
                }
                .into());
            }
        }

        let headers = if self.config.headers {
            ("headers on", "ATH1")
        } else {
            ("headers off", "ATH0")
        };
        let steps = [
            ("reset", "ATZ"),
            ("echo off", "ATE0"),
            headers,
            ("linefeeds off", "ATL0"),
            ("adaptive timing", "ATAT1"),
        ];
        for (step, command) in steps {
            let accept = if command == "ATZ" { accepts_reset } else { accepts_ok };
            self.init_step(step, command, accept).await?;
        }
        if !self.transition_within(Some(generation), ConnectionState::ConnectedToAdapter) {
            return Err(ObdError::Stopped);
        }

        let mut profile = self.negotiate().await?;
        if self.config.discover_supported_pids {
            self.discover_supported_pids(&mut profile).await;
        }
        Ok(profile)
    }

    /// Send one handshake command with bounded retries.
    async fn init_step(&self, step: &str, command: &str, accept: fn(&[String]) -> bool) -> ObdResult<()> {
        let attempts = self.config.attempts();
        let mut reason = String::from("not attempted");
        for attempt in 1..=attempts {
            match self.exchange(command).await {
                Ok(lines) if accept(&lines) => return Ok(()),
                Ok(lines) => reason = format!("unexpected reply {:?}", lines.join(" ")),
                Err(e @ (TransportError::NotConnected | TransportError::Closed)) => return Err(e.into()),
                Err(e) => reason = e.to_string(),
            }
            tracing::warn!(
                session_id = %self.id,
                step,
                command,
                attempt,
                attempts,
                reason = %reason,
                "adapter step failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }
        Err(ObdError::AdapterInitializationFailed {
            step: step.to_string(),
            reason,
        })
    }

    async fn negotiate(&self) -> ObdResult<VehicleProfile> {
        let requested = self.config.protocol;
        self.init_step("select protocol", &requested.select_command(), accepts_ok)
            .await?;
        match self.validate_with_retries(requested).await {
            Ok(profile) => return Ok(profile),
            Err(reason) if requested != ObdProtocol::Auto => {
                return Err(ObdError::AdapterInitializationFailed {
                    step: format!("protocol {requested}"),
                    reason,
                });
            }
            Err(reason) => {
                tracing::warn!(
                    session_id = %self.id,
                    reason = %reason,
                    "automatic protocol selection failed, trying each protocol"
                );
            }
        }

        for candidate in ObdProtocol::FALLBACK_ORDER {
            match self
                .init_step("select protocol", &candidate.select_command(), accepts_ok)
                .await
            {
                Ok(()) => {}
                Err(e @ ObdError::Transport(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(session_id = %self.id, protocol = %candidate, error = %e, "protocol rejected");
                    continue;
                }
            }
            match self.validate_with_retries(candidate).await {
                Ok(profile) => return Ok(profile),
                Err(reason) => {
                    tracing::debug!(session_id = %self.id, protocol = %candidate, reason = %reason, "no vehicle response");
                }
            }
        }
        Err(ObdError::AdapterInitializationFailed {
            step: "protocol negotiation".to_string(),
            reason: "no protocol answered the PID support query".to_string(),
        })
    }

    async fn validate_with_retries(&self, candidate: ObdProtocol) -> Result<VehicleProfile, String> {
        let attempts = self.config.attempts();
        let mut reason = String::from("not attempted");
        for attempt in 1..=attempts {
            match self.validate(candidate).await {
                Ok(profile) => return Ok(profile),
                Err(e) => reason = e,
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }
        Err(reason)
    }

    /// Issue the mode 01 PID 00 support query and record who answered.
    async fn validate(&self, candidate: ObdProtocol) -> Result<VehicleProfile, String> {
        let lines = self.exchange("0100").await.map_err(|e| e.to_string())?;
        if let Some(status) = lines.iter().find_map(|l| match classify_line(l) {
            ReplyLine::Status(status) if status.is_failure() => Some(status),
            _ => None,
        }) {
            return Err(format!("adapter reported {status}"));
        }

        let protocol = if candidate == ObdProtocol::Auto {
            self.detect_protocol().await?
        } else {
            candidate
        };
        let assembler = FrameAssembler::new(
            FrameLayout::for_protocol(protocol, self.config.headers),
            self.config.default_ecu_id,
        );
        let outcome = assembler.assemble(&lines);

        let mut profile = VehicleProfile::new(protocol);
        for message in &outcome.messages {
            if let Some(bitmap) = support_bitmap(&message.payload, 0x00) {
                profile.ecus.insert(message.ecu_id);
                profile.supported_pids.extend(supported_pids(0x00, bitmap));
            }
        }
        if profile.ecus.is_empty() {
            return Err(if outcome.no_data {
                "no data".to_string()
            } else {
                "no ECU answered the PID support query".to_string()
            });
        }
        Ok(profile)
    }

    /// Ask the adapter which protocol automatic selection settled on.
    async fn detect_protocol(&self) -> Result<ObdProtocol, String> {
        let lines = self.exchange("ATDPN").await.map_err(|e| e.to_string())?;
        lines
            .iter()
            .filter_map(|l| ObdProtocol::from_elm_reply(l))
            .find(|p| *p != ObdProtocol::Auto)
            .ok_or_else(|| format!("unrecognized protocol reply {:?}", lines.join(" ")))
    }

    /// Walk the support bitmaps `0120`, `0140`, ... while each base PID is
    /// itself marked supported.
    async fn discover_supported_pids(&self, profile: &mut VehicleProfile) {
        let assembler = FrameAssembler::new(
            FrameLayout::for_protocol(profile.protocol, self.config.headers),
            self.config.default_ecu_id,
        );
        let mut base: u8 = 0x20;
        while base <= 0xC0 && profile.supported_pids.contains(&base) {
            let command = format!("{MODE_CURRENT_DATA:02X}{base:02X}");
            let lines = match self.exchange(&command).await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(session_id = %self.id, command, error = %e, "PID support query failed");
                    break;
                }
            };
            let outcome = assembler.assemble(&lines);
            let mut answered = false;
            for message in &outcome.messages {
                if let Some(bitmap) = support_bitmap(&message.payload, base) {
                    profile.supported_pids.extend(supported_pids(base, bitmap));
                    answered = true;
                }
            }
            if !answered {
                break;
            }
            base += 0x20;
        }
    }

    /// Close the transport and reset to `Disconnected`, whatever the current
    /// state. Idempotent. Does not wait for the pipe: an `establish` in
    /// progress finishes with [`ObdError::Stopped`] instead of promoting the
    /// session.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn stop_connection(&self) {
        {
            let mut inner = self.write();
            inner.generation += 1;
            inner.vehicle = None;
        }
        self.transport.disconnect().await;
        self.transition(ConnectionState::Disconnected);
    }

    // ── Vehicle requests ────────────────────────────────────────

    /// Request one catalog command. Each answering ECU gets its own reading.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn query(&self, key: CommandKey) -> ObdResult<QueryResponse> {
        self.require_vehicle()?;
        let family = CommandFamily::from_key(key).ok_or_else(|| ObdError::UnknownCommand(key.to_string()))?;
        if self.catalog.get(key).is_none() {
            return Err(DecodeError::Unmappable {
                service: key.service,
                pid: key.pid,
            }
            .into());
        }

        let outcome = self.request(&family.request()).await?;
        check_outcome(&outcome)?;
        let response = self.extractor().single_response(family, &outcome);
        tracing::debug!(session_id = %self.id, %key, ecus = response.readings.len(), "query answered");
        Ok(response)
    }

    /// Request up to six mode 01 PIDs in one composite exchange. Responses
    /// come back in the order of `pids`.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn query_batch(&self, pids: &[u8]) -> ObdResult<Vec<QueryResponse>> {
        self.require_vehicle()?;
        let request = compose_request(pids)?;
        let outcome = self.request(&request).await?;
        check_outcome(&outcome)?;
        Ok(self.extractor().batch_responses(pids, &outcome))
    }

    /// Read stored, pending or permanent trouble codes, grouped by ECU.
    ///
    /// An ECU whose reply cannot be decoded is logged and left out; the scan
    /// fails only if no ECU could be decoded.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn read_trouble_codes(&self, kind: DtcKind) -> Result<BTreeMap<EcuId, Vec<TroubleCode>>, ScanError> {
        self.sync_link();
        let state = self.state();
        if !state.is_vehicle_ready() {
            return Err(ScanError::NotReady(state));
        }

        let outcome = self
            .request(&format!("{:02X}", kind.service()))
            .await
            .map_err(|err| match err {
                ObdError::Transport(e) => ScanError::Transport(e),
                other => ScanError::Decode(other.to_string()),
            })?;
        if let Some(status) = outcome.failure() {
            return Err(ScanError::Decode(format!("adapter reported {status}")));
        }

        let mut failures = Vec::new();
        for (ecu_id, err) in &outcome.errors {
            tracing::warn!(session_id = %self.id, ecu = %format_args!("0x{ecu_id:X}"), error = %err, "trouble-code frames dropped");
            failures.push(format!("ECU 0x{ecu_id:X}: {err}"));
        }

        let mut codes = BTreeMap::new();
        for (ecu_id, decoded) in TroubleCodeCodec::decode_response(kind, &outcome.messages) {
            match decoded {
                Ok(list) => {
                    let resolved: Vec<TroubleCode> = list
                        .into_iter()
                        .map(|code| self.dtc_db.resolve(ecu_id, code))
                        .collect();
                    codes.insert(ecu_id, resolved);
                }
                Err(err) => {
                    tracing::warn!(session_id = %self.id, ecu = %format_args!("0x{ecu_id:X}"), error = %err, "trouble-code reply rejected");
                    failures.push(format!("ECU 0x{ecu_id:X}: {err}"));
                }
            }
        }

        if codes.is_empty() && !failures.is_empty() {
            return Err(ScanError::Decode(failures.join("; ")));
        }
        let total: usize = codes.values().map(Vec::len).sum();
        tracing::info!(session_id = %self.id, kind = ?kind, ecus = codes.len(), codes = total, "trouble codes read");
        Ok(codes)
    }

    /// Clear trouble codes (mode 04). Returns the ECUs that acknowledged.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn clear_trouble_codes(&self) -> ObdResult<BTreeSet<EcuId>> {
        self.require_vehicle()?;
        let outcome = self.request(&format!("{MODE_CLEAR_DTCS:02X}")).await?;
        check_outcome(&outcome)?;

        let positive = MODE_CLEAR_DTCS + RESPONSE_SID_OFFSET;
        let mut acknowledged = BTreeSet::new();
        let mut rejection = None;
        for message in &outcome.messages {
            match message.payload.as_slice() {
                [sid, ..] if *sid == positive => {
                    acknowledged.insert(message.ecu_id);
                }
                [NEGATIVE_RESPONSE_SID, _, nrc, ..] => {
                    rejection.get_or_insert(DecodeError::NegativeResponse {
                        service: MODE_CLEAR_DTCS,
                        nrc: *nrc,
                    });
                }
                [sid, ..] => {
                    rejection.get_or_insert(DecodeError::WrongService {
                        expected: positive,
                        got: *sid,
                    });
                }
                [] => {}
            }
        }

        if acknowledged.is_empty() {
            return Err(rejection.unwrap_or(DecodeError::NoData).into());
        }
        tracing::info!(session_id = %self.id, ecus = acknowledged.len(), "trouble codes cleared");
        Ok(acknowledged)
    }

    /// Vehicle identification number (mode 09 info type 02).
    pub async fn read_vin(&self) -> ObdResult<String> {
        let response = self.query(CommandKey::new(MODE_VEHICLE_INFO, 0x02)).await?;
        match response.primary() {
            Some(DecodeResult::Text(vin)) => Ok(vin.clone()),
            Some(other) => Err(ObdError::InvalidRequest(format!("VIN decoded as {other}"))),
            None => Err(response_failure(&response)),
        }
    }
}

/// Reject exchanges that produced nothing to decode.
fn check_outcome(outcome: &AssemblyOutcome) -> ObdResult<()> {
    if let Some(status) = outcome.failure() {
        return Err(ObdError::Adapter(status.to_string()));
    }
    if outcome.messages.is_empty() && outcome.errors.is_empty() {
        return Err(DecodeError::NoData.into());
    }
    Ok(())
}

/// First per-ECU failure of a response with no successful reading.
fn response_failure(response: &QueryResponse) -> ObdError {
    response
        .readings
        .iter()
        .find_map(|(ecu_id, reading)| match reading {
            Err(ResponseError::Frame(source)) => Some(ObdError::FrameAssembly {
                ecu_id: *ecu_id,
                source: source.clone(),
            }),
            Err(ResponseError::Decode(err)) => Some(ObdError::Decode(err.clone())),
            Ok(_) => None,
        })
        .unwrap_or(ObdError::Decode(DecodeError::NoData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, Script};

    const PID_SUPPORT: &str = "7E8 06 41 00 BE 3E B8 10";

    fn session(mock: &Arc<MockTransport>) -> AdapterSession {
        AdapterSession::new(mock.clone(), SessionConfig::default())
    }

    fn vehicle_mock() -> Arc<MockTransport> {
        Arc::new(MockTransport::elm327().with_reply("0100", &[PID_SUPPORT]))
    }

    #[tokio::test]
    async fn handshake_runs_in_order() {
        let mock = vehicle_mock();
        let session = session(&mock);
        let profile = session.establish().await.unwrap();

        assert_eq!(
            mock.sent_commands(),
            vec!["ATZ", "ATE0", "ATH1", "ATL0", "ATAT1", "ATSP0", "0100", "ATDPN"]
        );
        assert_eq!(profile.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(profile.ecus, BTreeSet::from([0x7E8]));
        assert!(profile.supports(0x0C));
        assert!(!profile.supports(0x02));
        assert!(session.state().is_vehicle_ready());
    }

    #[tokio::test]
    async fn headers_off_sends_ath0() {
        let mock = Arc::new(MockTransport::elm327().with_reply("0100", &["41 00 BE 3E B8 10"]));
        let config = SessionConfig {
            headers: false,
            ..Default::default()
        };
        let session = AdapterSession::new(mock.clone(), config);
        let profile = session.establish().await.unwrap();

        assert_eq!(mock.send_count("ATH0"), 1);
        assert_eq!(mock.send_count("ATH1"), 0);
        assert_eq!(profile.ecus, BTreeSet::from([DEFAULT_ECU_ID]));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_handshake_step_fails_session() {
        let mock = vehicle_mock();
        mock.on("ATE0", &["?"]);
        let session = session(&mock);

        let err = session.establish().await.unwrap_err();
        match err {
            ObdError::AdapterInitializationFailed { step, .. } => assert_eq!(step, "echo off"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mock.send_count("ATE0"), 3);
        assert!(matches!(session.state(), ConnectionState::Error { .. }));
        assert!(!mock.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_step_recovers_within_retries() {
        let mock = vehicle_mock();
        mock.queue("ATL0", Script::Fail(TransportError::Timeout { timeout_ms: 1000 }));
        let session = session(&mock);

        session.establish().await.unwrap();
        assert_eq!(mock.send_count("ATL0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_protocol_is_never_replaced() {
        let mock = Arc::new(MockTransport::elm327());
        let config = SessionConfig {
            protocol: ObdProtocol::Iso15765_4Can11bit500,
            ..Default::default()
        };
        let session = AdapterSession::new(mock.clone(), config);

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, ObdError::AdapterInitializationFailed { .. }));
        assert_eq!(mock.send_count("ATSP6"), 1);
        assert_eq!(mock.send_count("ATSP0"), 0);
        assert_eq!(mock.send_count("ATSP7"), 0);
        assert_eq!(mock.send_count("0100"), 3);
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_error() {
        let mock = vehicle_mock();
        mock.fail_connect(TransportError::Connect("refused".into()));
        let session = session(&mock);

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, ObdError::Transport(TransportError::Connect(_))));
        assert!(matches!(session.state(), ConnectionState::Error { .. }));
    }

    #[tokio::test]
    async fn requests_need_a_vehicle() {
        let mock = vehicle_mock();
        let session = session(&mock);

        let err = session.query(CommandKey::live(0x0C)).await.unwrap_err();
        assert!(matches!(err, ObdError::NotReady { state: ConnectionState::Disconnected }));
        assert!(matches!(session.send_raw("ATI").await, Err(ObdError::NotReady { .. })));
        assert!(matches!(
            session.read_trouble_codes(DtcKind::Stored).await,
            Err(ScanError::NotReady(ConnectionState::Disconnected))
        ));
        assert!(mock.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn stop_connection_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(32);
        let mock = vehicle_mock();
        let session = session(&mock).with_events(tx);

        session.establish().await.unwrap();
        session.stop_connection().await;
        session.stop_connection().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.vehicle().is_none());

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { to, .. } = event {
                transitions.push(to);
            }
        }
        assert_eq!(
            transitions,
            vec![
                ConnectionState::Connecting,
                ConnectionState::ConnectedToAdapter,
                ConnectionState::ConnectedToVehicle {
                    protocol: ObdProtocol::Iso15765_4Can11bit500
                },
                ConnectionState::Disconnected,
            ]
        );
    }

    fn spawn_establish(session: &Arc<AdapterSession>) -> tokio::task::JoinHandle<ObdResult<VehicleProfile>> {
        let session = Arc::clone(session);
        tokio::spawn(async move { session.establish().await })
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_discovery_is_final() {
        let mock = Arc::new(
            MockTransport::elm327()
                .with_reply("0100", &["7E8 06 41 00 BE 3E B8 13"])
                .with_reply("0120", &["7E8 06 41 20 80 01 80 01"]),
        );
        mock.set_delay(std::time::Duration::from_millis(100));
        let session = Arc::new(session(&mock));
        let establishing = spawn_establish(&session);

        // Eight 100ms exchanges precede the 0120 support query.
        tokio::time::sleep(std::time::Duration::from_millis(850)).await;
        assert_eq!(mock.sent_commands().last().map(String::as_str), Some("0120"));
        session.stop_connection().await;

        assert!(matches!(establishing.await.unwrap(), Err(ObdError::Stopped)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.vehicle().is_none());
        assert!(!mock.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_handshake_is_not_an_error() {
        let mock = vehicle_mock();
        mock.set_delay(std::time::Duration::from_millis(100));
        let session = Arc::new(session(&mock));
        let establishing = spawn_establish(&session);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        session.stop_connection().await;

        assert!(matches!(establishing.await.unwrap(), Err(ObdError::Stopped)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!mock.is_connected());
        // The handshake gave up at the first refused send.
        assert_eq!(mock.send_count("ATL0"), 0);

        session.establish().await.unwrap();
        assert!(session.state().is_vehicle_ready());
    }

    #[tokio::test]
    async fn lost_link_moves_session_to_error() {
        let mock = vehicle_mock();
        let session = session(&mock);
        session.establish().await.unwrap();

        mock.disconnect().await;
        let err = session.query(CommandKey::live(0x0C)).await.unwrap_err();
        assert!(matches!(err, ObdError::NotReady { state: ConnectionState::Error { .. } }));
    }

    #[tokio::test]
    async fn reestablish_after_error() {
        let mock = vehicle_mock();
        mock.fail_connect(TransportError::Connect("refused".into()));
        let session = session(&mock);
        assert!(session.establish().await.is_err());

        session.establish().await.unwrap();
        assert!(session.state().is_vehicle_ready());
    }

    #[tokio::test]
    async fn unknown_and_unmappable_keys() {
        let mock = vehicle_mock();
        let session = session(&mock);
        session.establish().await.unwrap();

        assert!(matches!(
            session.query(CommandKey::new(0x05, 0x01)).await,
            Err(ObdError::UnknownCommand(_))
        ));
        assert!(matches!(
            session.query(CommandKey::live(0xFE)).await,
            Err(ObdError::Decode(DecodeError::Unmappable { service: 0x01, pid: 0xFE }))
        ));
    }

    #[test]
    fn support_bitmap_requires_matching_pid() {
        assert_eq!(
            support_bitmap(&[0x41, 0x20, 1, 2, 3, 4], 0x20),
            Some(&[1u8, 2, 3, 4][..])
        );
        assert_eq!(support_bitmap(&[0x41, 0x00, 1, 2, 3, 4], 0x20), None);
        assert_eq!(support_bitmap(&[0x41, 0x20, 1, 2], 0x20), None);
    }
}
