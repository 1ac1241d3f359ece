//! Continuous polling with adaptive interval.
//!
//! One cycle requests every configured command in turn. Cycles never
//! overlap: a tick that fires while a cycle is still running is skipped,
//! not queued. Failures stretch the interval by 1.5×, clean cycles shrink it
//! by 0.9×, within `[max(0.2s, base), max(4 × base, 2s)]`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use elm_protocol::DecodeResult;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::catalog::CommandKey;
use crate::config::PollerConfig;
use crate::error::{ObdError, ObdResult};
use crate::extract::QueryResponse;
use crate::session::AdapterSession;
use crate::types::*;

const MIN_FLOOR: Duration = Duration::from_millis(200);
const MAX_FLOOR: Duration = Duration::from_secs(2);
/// About thirty years.
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// Interval arithmetic of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        let min = base.max(MIN_FLOOR);
        let max = base.saturating_mul(4).max(MAX_FLOOR);
        Self {
            min,
            max,
            current: base.clamp(min, max),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Apply one cycle's outcome and return the new interval.
    pub fn on_cycle(&mut self, failed: bool) -> Duration {
        self.current = if failed {
            self.current.saturating_add(self.current / 2).min(self.max)
        } else {
            (self.current - self.current / 10).max(self.min)
        };
        self.current
    }
}

/// Aggregated result of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollCycle {
    pub timestamp: DateTime<Utc>,
    /// Commands that produced a value, from the lowest answering ECU id.
    pub values: BTreeMap<CommandKey, DecodeResult>,
    /// Commands that produced nothing this cycle, with the reason.
    pub failures: Vec<(CommandKey, String)>,
    /// Interval chosen for the next tick.
    pub next_interval: Duration,
}

impl PollCycle {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct PollerShared {
    in_flight: AtomicBool,
    backoff: Mutex<Backoff>,
    consecutive_failures: AtomicU32,
}

impl PollerShared {
    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlight(Arc<PollerShared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Polls a fixed command list against one session.
pub struct ContinuousPoller {
    session: Arc<AdapterSession>,
    config: Arc<PollerConfig>,
    shared: Arc<PollerShared>,
}

impl ContinuousPoller {
    pub fn new(session: Arc<AdapterSession>, config: PollerConfig) -> Self {
        let backoff = Backoff::new(config.base_interval());
        Self {
            session,
            config: Arc::new(config),
            shared: Arc::new(PollerShared {
                in_flight: AtomicBool::new(false),
                backoff: Mutex::new(backoff),
                consecutive_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.shared.backoff().current()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Start one cycle, or return `None` if the previous one is still running.
    pub fn tick(&self) -> Option<JoinHandle<PollCycle>> {
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(session_id = %self.session.id(), "poll tick skipped, cycle still running");
            return None;
        }
        let guard = InFlight(Arc::clone(&self.shared));
        let session = Arc::clone(&self.session);
        let config = Arc::clone(&self.config);
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(async move {
            let cycle = run_cycle(&session, &config, &shared).await;
            drop(guard);
            cycle
        }))
    }

    /// Drive ticks until `shutdown` turns true, the receiver is dropped, or
    /// the session stops being connected to a vehicle (reported as an error).
    pub async fn run(&self, results: mpsc::Sender<ObdResult<PollCycle>>, mut shutdown: watch::Receiver<bool>) {
        let session_id = self.session.id();
        tracing::info!(
            %session_id,
            commands = self.config.commands.len(),
            interval_ms = self.current_interval().as_millis() as u64,
            "poller started"
        );

        let mut next = Instant::now();
        let mut started = next;
        let mut pending: Option<JoinHandle<PollCycle>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                joined = async {
                    match pending.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    pending = None;
                    match joined {
                        Ok(cycle) => {
                            next = deadline(started, cycle.next_interval);
                            if results.send(Ok(cycle)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::error!(%session_id, error = %e, "poll cycle task failed"),
                    }
                }
                () = time::sleep_until(next) => {
                    let state = self.session.state();
                    if !state.is_vehicle_ready() {
                        tracing::warn!(%session_id, state = %state, "session no longer connected, poller stopping");
                        // Receiver may already be gone; the poller stops either way.
                        let _ = results.send(Err(ObdError::NotReady { state })).await;
                        break;
                    }
                    let now = Instant::now();
                    next = deadline(now, self.current_interval());
                    if let Some(handle) = self.tick() {
                        started = now;
                        pending = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = pending {
            if let Ok(cycle) = handle.await {
                let _ = results.send(Ok(cycle)).await;
            }
        }
        tracing::info!(%session_id, "poller stopped");
    }
}

/// `from + interval`, capped where `Instant` arithmetic would overflow.
fn deadline(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval)
        .unwrap_or_else(|| from + Duration::from_secs(FAR_FUTURE_SECS))
}

async fn run_cycle(session: &AdapterSession, config: &PollerConfig, shared: &PollerShared) -> PollCycle {
    let mut values = BTreeMap::new();
    let mut failures = Vec::new();

    let mut record = |key: CommandKey, result: Result<QueryResponse, String>| {
        let reason = match result {
            Ok(response) => match response.primary() {
                Some(value) => {
                    values.insert(key, value.clone());
                    return;
                }
                None => response
                    .failure()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no ECU answered".to_string()),
            },
            Err(reason) => reason,
        };
        tracing::warn!(session_id = %session.id(), %key, reason = %reason, "poll command failed");
        failures.push((key, reason));
    };

    if config.batch {
        let (live, other): (Vec<CommandKey>, Vec<CommandKey>) = config
            .commands
            .iter()
            .copied()
            .partition(|k| k.service == MODE_CURRENT_DATA);
        let pids: Vec<u8> = live.iter().filter_map(|k| u8::try_from(k.pid).ok()).collect();
        for chunk in pids.chunks(MAX_BATCH_PIDS) {
            match session.query_batch(chunk).await {
                Ok(responses) => {
                    for response in responses {
                        record(response.key, Ok(response));
                    }
                }
                Err(e) => {
                    for &pid in chunk {
                        record(CommandKey::live(pid), Err(e.to_string()));
                    }
                }
            }
        }
        for key in other {
            record(key, session.query(key).await.map_err(|e| e.to_string()));
        }
    } else {
        for &key in &config.commands {
            record(key, session.query(key).await.map_err(|e| e.to_string()));
        }
    }

    let failed = !failures.is_empty();
    let next_interval = shared.backoff().on_cycle(failed);
    let consecutive = if failed {
        shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    } else {
        shared.consecutive_failures.store(0, Ordering::Release);
        0
    };
    tracing::debug!(
        session_id = %session.id(),
        values = values.len(),
        failures = failures.len(),
        consecutive_failures = consecutive,
        next_interval_ms = next_interval.as_millis() as u64,
        "poll cycle complete"
    );

    PollCycle {
        timestamp: Utc::now(),
        values,
        failures,
        next_interval,
    }
}
