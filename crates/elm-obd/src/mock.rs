//! Scripted mock transport for testing.
//!
//! Replies are scripted per command, either persistently or as a one-shot
//! queue that takes precedence. Every sent command is recorded. With a reply
//! delay set, replies are delivered from a background task through a
//! [`ReplySlot`], the way a callback-driven radio transport delivers them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{TransportError, TransportResult};
use crate::transport::{LinkState, ReplySlot, Transport};

/// One scripted reaction to a command.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with these lines.
    Reply(Vec<String>),
    /// Fail the exchange with this error.
    Fail(TransportError),
    /// Never answer; the exchange times out.
    Silent,
}

impl Script {
    pub fn lines(lines: &[&str]) -> Self {
        Script::Reply(lines.iter().map(|l| l.to_string()).collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Normalize a command the way the adapter reads it: no spaces, uppercase.
fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Mock ELM327 transport with scripted replies and command recording.
pub struct MockTransport {
    /// Replies used every time a command is sent.
    persistent: Mutex<HashMap<String, Script>>,
    /// One-shot replies consumed in FIFO order before `persistent`.
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    /// All commands passed to `send` (for test assertions).
    sent: Mutex<Vec<String>>,
    /// Error returned by the next `connect`, if any.
    connect_error: Mutex<Option<TransportError>>,
    delay: Mutex<Duration>,
    reply_timeout: Duration,
    slot: Arc<ReplySlot>,
    link: watch::Sender<LinkState>,
}

impl MockTransport {
    /// Create a mock with nothing scripted. Unscripted commands get `NO DATA`.
    pub fn new() -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            persistent: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            reply_timeout: Duration::from_secs(1),
            slot: Arc::new(ReplySlot::new()),
            link,
        }
    }

    /// A mock that answers the adapter handshake like a genuine ELM327 with
    /// automatic protocol selection landing on CAN 11-bit 500 kbaud.
    pub fn elm327() -> Self {
        let mock = Self::new();
        mock.on("ATZ", &["ELM327 v1.5"]);
        for cmd in ["ATE0", "ATH1", "ATH0", "ATL0", "ATAT1"] {
            mock.on(cmd, &["OK"]);
        }
        for id in '0'..='9' {
            mock.on(&format!("ATSP{id}"), &["OK"]);
        }
        mock.on("ATDPN", &["A6"]);
        mock
    }

    /// Builder form of [`MockTransport::on`].
    pub fn with_reply(self, command: &str, lines: &[&str]) -> Self {
        self.on(command, lines);
        self
    }

    /// Persistently answer `command` with `lines`.
    pub fn on(&self, command: &str, lines: &[&str]) {
        self.script(command, Script::lines(lines));
    }

    /// Persistently react to `command` with `script`.
    pub fn script(&self, command: &str, script: Script) {
        lock(&self.persistent).insert(normalize(command), script);
    }

    /// Queue a one-shot reaction to `command`, used before any persistent one.
    pub fn queue(&self, command: &str, script: Script) {
        lock(&self.queued)
            .entry(normalize(command))
            .or_default()
            .push_back(script);
    }

    /// Make the next `connect` fail with `err`.
    pub fn fail_connect(&self, err: TransportError) {
        *lock(&self.connect_error) = Some(err);
    }

    /// Deliver replies after `delay` instead of immediately.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// How long an exchange waits for a reply before timing out.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Copies of all commands that were sent, normalized.
    pub fn sent_commands(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// How many times `command` was sent.
    pub fn send_count(&self, command: &str) -> usize {
        let command = normalize(command);
        lock(&self.sent).iter().filter(|c| **c == command).count()
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow() == LinkState::Connected
    }

    fn next_script(&self, command: &str) -> Script {
        if let Some(script) = lock(&self.queued)
            .get_mut(command)
            .and_then(VecDeque::pop_front)
        {
            return script;
        }
        lock(&self.persistent)
            .get(command)
            .cloned()
            .unwrap_or_else(|| Script::lines(&["NO DATA"]))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _timeout: Duration) -> TransportResult<()> {
        self.link.send_replace(LinkState::Connecting);
        let failure = lock(&self.connect_error).take();
        if let Some(err) = failure {
            self.link.send_replace(LinkState::Failed);
            return Err(err);
        }
        self.link.send_replace(LinkState::Connected);
        Ok(())
    }

    async fn send(&self, command: &str) -> TransportResult<Vec<String>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let command = normalize(command);
        lock(&self.sent).push(command.clone());
        let script = self.next_script(&command);
        let delay = *lock(&self.delay);

        let exchange = self.slot.open();
        let id = exchange.id;
        let outcome = match script {
            Script::Reply(lines) => Some(Ok(lines)),
            Script::Fail(err) => Some(Err(err)),
            Script::Silent => None,
        };
        if let Some(outcome) = outcome {
            if delay.is_zero() {
                self.slot.resolve(id, outcome);
            } else {
                let slot = Arc::clone(&self.slot);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    slot.resolve(id, outcome);
                });
            }
        }
        self.slot.wait(exchange, self.reply_timeout).await
    }

    async fn disconnect(&self) {
        self.link.send_replace(LinkState::Disconnected);
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}
