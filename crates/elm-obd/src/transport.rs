//! Transport abstraction.
//!
//! `Transport` trait with `connect`/`send`/`disconnect` and a link-state
//! stream. Concrete transports (radio, socket, serial) live outside this
//! crate; `MockTransport` (in `mock.rs`) scripts replies for tests.
//!
//! One `send` is one full request/response exchange, terminated by the
//! adapter's `>` prompt. Exactly one exchange may be outstanding at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::error::{TransportError, TransportResult};

/// Physical link state reported by a transport. Monotonic per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Trait for byte/line transports to an ELM327 adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link, failing after `timeout`.
    async fn connect(&self, timeout: Duration) -> TransportResult<()>;

    /// Send one command and return the reply lines up to the `>` prompt.
    async fn send(&self, command: &str) -> TransportResult<Vec<String>>;

    /// Close the link. Idempotent.
    async fn disconnect(&self);

    /// Subscribe to link-state changes.
    fn link_state(&self) -> watch::Receiver<LinkState>;
}

/// Split a raw adapter reply into trimmed, non-empty lines without the prompt.
///
/// ELM327 with `ATL0` terminates lines with a bare `\r`; `str::lines()` would
/// not split those.
pub fn split_reply(raw: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(|line| line.replace('>', ""))
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

// ── Single-resolution reply slot ────────────────────────────────

struct Pending {
    id: u64,
    tx: oneshot::Sender<TransportResult<Vec<String>>>,
}

/// An exchange opened on a [`ReplySlot`].
pub struct Exchange {
    pub id: u64,
    rx: oneshot::Receiver<TransportResult<Vec<String>>>,
}

/// One-shot completion cell for callback-driven transports.
///
/// Every exchange gets a fresh id. Only the pending id can be resolved, and
/// only once: a timeout claims the slot itself, so a reply arriving late is
/// rejected instead of completing a later exchange.
#[derive(Default)]
pub struct ReplySlot {
    next_id: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl ReplySlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new exchange. Any exchange still pending is abandoned and its
    /// waiter sees `TransportError::Closed`.
    pub fn open(&self) -> Exchange {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.lock().replace(Pending { id, tx }) {
            tracing::debug!(stale_id = stale.id, id, "abandoning unresolved exchange");
        }
        Exchange { id, rx }
    }

    /// Resolve exchange `id`. Returns `false` when that exchange was already
    /// resolved, timed out, or superseded.
    pub fn resolve(&self, id: u64, result: TransportResult<Vec<String>>) -> bool {
        let taken = self.lock().take_if(|p| p.id == id);
        match taken {
            Some(pending) => pending.tx.send(result).is_ok(),
            None => {
                tracing::debug!(id, "late or duplicate reply ignored");
                false
            }
        }
    }

    /// Id of the exchange currently awaiting a reply.
    pub fn pending_id(&self) -> Option<u64> {
        self.lock().as_ref().map(|p| p.id)
    }

    /// Wait for `exchange` to resolve, or claim it as timed out.
    pub async fn wait(&self, exchange: Exchange, timeout: Duration) -> TransportResult<Vec<String>> {
        let Exchange { id, mut rx } = exchange;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                let timed_out = TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                let claimed = self.lock().take_if(|p| p.id == id).is_some();
                if claimed {
                    Err(timed_out)
                } else {
                    // The transport won the race; honor its resolution.
                    rx.try_recv().unwrap_or(Err(timed_out))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reply_handles_bare_carriage_returns() {
        let lines = split_reply("7E8 06 41 00 BE 3F A8 13\r7E9 06 41 00 98 18 80 11\r\r>");
        assert_eq!(lines, vec!["7E8 06 41 00 BE 3F A8 13", "7E9 06 41 00 98 18 80 11"]);
    }

    #[test]
    fn split_reply_drops_prompt_and_blanks() {
        assert!(split_reply("\r\n>").is_empty());
        assert_eq!(split_reply("OK\r\n>"), vec!["OK"]);
    }

    #[tokio::test]
    async fn resolve_completes_pending_exchange() {
        let slot = ReplySlot::new();
        let exchange = slot.open();
        let id = exchange.id;
        assert!(slot.resolve(id, Ok(vec!["OK".into()])));
        let reply = slot.wait(exchange, Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply, vec!["OK"]);
        assert_eq!(slot.pending_id(), None);
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let slot = ReplySlot::new();
        let exchange = slot.open();
        let id = exchange.id;
        assert!(slot.resolve(id, Ok(vec!["first".into()])));
        assert!(!slot.resolve(id, Ok(vec!["second".into()])));
        let reply = slot.wait(exchange, Duration::from_millis(10)).await.unwrap();
        assert_eq!(reply, vec!["first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_rejected() {
        let slot = ReplySlot::new();
        let first = slot.open();
        let first_id = first.id;
        let result = slot.wait(first, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout { timeout_ms: 50 })));

        let second = slot.open();
        let second_id = second.id;
        // The stale callback for the first exchange must not complete the second.
        assert!(!slot.resolve(first_id, Ok(vec!["stale".into()])));
        assert_eq!(slot.pending_id(), Some(second_id));

        assert!(slot.resolve(second_id, Ok(vec!["fresh".into()])));
        let reply = slot.wait(second, Duration::from_millis(50)).await.unwrap();
        assert_eq!(reply, vec!["fresh"]);
    }

    #[tokio::test]
    async fn superseded_exchange_sees_closed() {
        let slot = ReplySlot::new();
        let first = slot.open();
        let _second = slot.open();
        let result = slot.wait(first, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
