//! Shared test harness for E2E integration tests.
//!
//! Wires an `AdapterSession` to a scripted `MockTransport` that answers the
//! ELM327 handshake and presents a two-ECU CAN vehicle (engine `7E8`,
//! transmission `7E9`).

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use elm_obd::frame::segment_can11;
use elm_obd::{AdapterSession, CommandCatalog, MockTransport, Script, SessionConfig};
use elm_protocol::SessionEvent;

/// PID 00 support replies. The engine ECU also flags PID 20, so the
/// session walks on to `0120`.
pub const SUPPORT_00: [&str; 2] = ["7E8 06 41 00 BE 3E B8 13", "7E9 06 41 00 98 18 00 00"];

/// PID 20 support reply: PIDs 21, 30, 31 and 40.
pub const SUPPORT_20: [&str; 1] = ["7E8 06 41 20 80 01 80 01"];

pub const ENGINE: u32 = 0x7E8;
pub const TRANSMISSION: u32 = 0x7E9;

pub const VIN: &str = "1HGCM82633A004352";

/// End-to-end harness around a mock adapter.
pub struct TestHarness {
    /// The scripted adapter; also used for assertions on sent commands.
    pub mock: Arc<MockTransport>,
    pub session: Arc<AdapterSession>,
    /// Events emitted by the session.
    pub events: mpsc::Receiver<SessionEvent>,
}

impl TestHarness {
    /// Harness over the default two-ECU vehicle with default settings.
    pub fn new() -> Self {
        Self::with_mock(vehicle_mock(), SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_mock(vehicle_mock(), config)
    }

    /// Harness over a caller-built mock.
    pub fn with_mock(mock: MockTransport, config: SessionConfig) -> Self {
        Self::build(mock, config, CommandCatalog::standard())
    }

    pub fn with_catalog(catalog: CommandCatalog) -> Self {
        Self::build(vehicle_mock(), SessionConfig::default(), catalog)
    }

    fn build(mock: MockTransport, config: SessionConfig, catalog: CommandCatalog) -> Self {
        let mock = Arc::new(mock);
        let (tx, events) = mpsc::channel(64);
        let session = AdapterSession::new(mock.clone(), config)
            .with_catalog(Arc::new(catalog))
            .with_events(tx);
        Self {
            mock,
            session: Arc::new(session),
            events,
        }
    }

    /// Harness already connected to the vehicle.
    pub async fn connected() -> Self {
        let h = Self::new();
        h.session.establish().await.expect("vehicle connects");
        h
    }

    /// Persistently answer `command` with `lines`.
    pub fn reply(&self, command: &str, lines: &[&str]) {
        self.mock.on(command, lines);
    }

    /// Persistently answer `command` with owned lines.
    pub fn reply_lines(&self, command: &str, lines: Vec<String>) {
        self.mock.script(command, Script::Reply(lines));
    }

    /// All events emitted so far.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// ELM327 mock presenting the default vehicle.
pub fn vehicle_mock() -> MockTransport {
    let mock = MockTransport::elm327();
    mock.on("0100", &SUPPORT_00);
    mock.on("0120", &SUPPORT_20);
    mock
}

/// ISO-TP lines for a mode 09 VIN reply from `ecu`.
pub fn vin_reply(ecu: u32, vin: &str) -> Vec<String> {
    let mut payload = vec![0x49, 0x02, 0x01];
    payload.extend_from_slice(vin.as_bytes());
    segment_can11(ecu, &payload)
}
