//! Connection lifecycle controller for one outbound channel.
//!
//! Owns the seven-state machine (disconnected → initiating → ready_to_scan →
//! scanning → active, plus disconnecting and error) and drives it with a
//! single reusable poll-until primitive: a cancellable task that probes the
//! provider on a fixed interval against an absolute deadline computed at
//! loop start. Only one poll task is outstanding per controller; starting a
//! new loop cancels the previous one so a transition can never fire twice.
//!
//! State lives in a shared container handed to every polling task by
//! reference, never captured by value at spawn time, so each tick reads the
//! freshest state.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use comanda_core::{current_unix_timestamp_ms, LogRotationPolicy};

use crate::channel_audit::ChannelAuditLog;
use crate::channel_provider::ChannelGateway;
use crate::channel_state_store::ChannelStateStore;
use crate::channel_status::ChannelStatus;

const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SCAN_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ConnectionState` values.
pub enum ConnectionState {
    Disconnected,
    Initiating,
    ReadyToScan,
    Scanning,
    Active,
    Disconnecting,
    Error,
}

impl ConnectionState {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Initiating => "initiating",
            Self::ReadyToScan => "ready_to_scan",
            Self::Scanning => "scanning",
            Self::Active => "active",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }

    /// Busy states have a transition in flight; unforced refreshes are
    /// suppressed while one is live.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Initiating | Self::Scanning | Self::Disconnecting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Polling tunables. Defaults match the production panel: 3 s lifecycle
/// polls bounded at 30 s, 5 s activation polls while the QR dialog is open.
pub struct ConnectionControllerConfig {
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub scan_poll_interval_ms: u64,
}

impl Default for ConnectionControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            scan_poll_interval_ms: DEFAULT_SCAN_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Read-only view the panel renders from.
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub last_checked_unix_ms: Option<u64>,
    pub connected_since_unix_ms: Option<u64>,
}

#[derive(Debug)]
struct ConnectionInner {
    state: ConnectionState,
    error: Option<String>,
    last_checked_unix_ms: Option<u64>,
    connected_since_unix_ms: Option<u64>,
}

/// Deferred I/O computed under the state lock, executed after release.
#[derive(Debug, Default)]
struct StateSideEffects {
    transition: Option<(ConnectionState, ConnectionState, Option<String>)>,
    persist_connected: Option<u64>,
    clear_connected: bool,
}

/// Freshness-guaranteed state container shared with polling tasks.
struct ConnectionShared {
    inner: Mutex<ConnectionInner>,
    state_store: ChannelStateStore,
    audit: ChannelAuditLog,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ConnectionSnapshot {
            state: inner.state,
            error: inner.error.clone(),
            last_checked_unix_ms: inner.last_checked_unix_ms,
            connected_since_unix_ms: inner.connected_since_unix_ms,
        }
    }

    fn stamp_checked(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.last_checked_unix_ms = Some(current_unix_timestamp_ms());
    }

    fn set_state(&self, next: ConnectionState, error: Option<String>) {
        let effects = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            apply_state_locked(&mut inner, next, error)
        };
        self.run_side_effects(effects);
    }

    /// Check-and-set under one lock; the command layer uses this to reject
    /// events that are not legal for the current state.
    fn transition_from(&self, allowed: &[ConnectionState], next: ConnectionState) -> Result<()> {
        let effects = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !allowed.contains(&inner.state) {
                bail!(
                    "cannot enter '{}' from '{}'",
                    next.as_str(),
                    inner.state.as_str()
                );
            }
            apply_state_locked(&mut inner, next, None)
        };
        self.run_side_effects(effects);
        Ok(())
    }

    fn run_side_effects(&self, effects: StateSideEffects) {
        if let Some(at_unix_ms) = effects.persist_connected {
            if let Err(error) = self.state_store.record_connected(at_unix_ms) {
                tracing::warn!(error = %error, "failed to persist connection start");
            }
        }
        if effects.clear_connected {
            if let Err(error) = self.state_store.clear_connected() {
                tracing::warn!(error = %error, "failed to clear connection start");
            }
        }
        if let Some((from, to, detail)) = effects.transition {
            if let Err(error) = self.audit.record(from.as_str(), to.as_str(), detail.as_deref()) {
                tracing::warn!(error = %error, "failed to record status-change audit entry");
            }
        }
    }
}

fn apply_state_locked(
    inner: &mut ConnectionInner,
    next: ConnectionState,
    error: Option<String>,
) -> StateSideEffects {
    let mut effects = StateSideEffects::default();
    let previous = inner.state;
    if previous != next || inner.error != error {
        inner.state = next;
        inner.error = error.clone();
        effects.transition = Some((previous, next, error));
    }
    if next == ConnectionState::Active && inner.connected_since_unix_ms.is_none() {
        let now = current_unix_timestamp_ms();
        inner.connected_since_unix_ms = Some(now);
        effects.persist_connected = Some(now);
    }
    if next == ConnectionState::Disconnected && inner.connected_since_unix_ms.is_some() {
        inner.connected_since_unix_ms = None;
        effects.clear_connected = true;
    }
    effects
}

/// Target and bounds for one poll loop.
struct StatusPollGoal {
    target: ChannelStatus,
    on_target: ConnectionState,
    interval: Duration,
    deadline: Option<Duration>,
    timeout_message: String,
}

struct PollTask {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls the provider until the target status, cancellation, or deadline.
/// Probe transport failures read as `disconnected` here; the graceful-
/// degradation side of the forced/unforced asymmetry.
async fn run_status_poll(
    gateway: Arc<dyn ChannelGateway + Send + Sync>,
    shared: Arc<ConnectionShared>,
    mut cancel_rx: watch::Receiver<bool>,
    goal: StatusPollGoal,
) {
    let deadline_at = goal.deadline.map(|deadline| Instant::now() + deadline);
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if let Some(deadline_at) = deadline_at {
            if Instant::now() >= deadline_at {
                shared.set_state(ConnectionState::Error, Some(goal.timeout_message));
                return;
            }
        }
        let reading = match gateway.probe_status().await {
            Ok(status) => status,
            Err(_) => ChannelStatus::Disconnected,
        };
        if *cancel_rx.borrow() {
            return;
        }
        shared.stamp_checked();
        if reading == goal.target {
            shared.set_state(goal.on_target, None);
            return;
        }
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(goal.interval) => {}
        }
    }
}

/// Owns the connection state machine and the lifecycle commands the panel
/// invokes. See the module docs for the polling and cancellation rules.
pub struct ConnectionController {
    gateway: Arc<dyn ChannelGateway + Send + Sync>,
    config: ConnectionControllerConfig,
    shared: Arc<ConnectionShared>,
    poll_task: Mutex<Option<PollTask>>,
}

impl ConnectionController {
    /// Restores the uptime anchor from the panel state file when present;
    /// the machine itself always starts in `disconnected` and relies on the
    /// mount-time forced refresh to converge.
    pub fn new(
        gateway: Arc<dyn ChannelGateway + Send + Sync>,
        state_dir: &Path,
        config: ConnectionControllerConfig,
    ) -> Self {
        let state_store = ChannelStateStore::new(state_dir);
        let audit = ChannelAuditLog::new(state_dir, LogRotationPolicy::from_env());
        let restored = state_store.load();
        let shared = Arc::new(ConnectionShared {
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                error: None,
                last_checked_unix_ms: None,
                connected_since_unix_ms: restored.connected_since_unix_ms,
            }),
            state_store,
            audit,
        });
        Self {
            gateway,
            config,
            shared,
            poll_task: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.snapshot()
    }

    /// `disconnected` → `initiating`: issues the deploy request and starts
    /// the bounded ready-to-scan poll. Provider failures fold into the
    /// `error` state with the message retained; misuse from another state is
    /// the caller's error.
    pub async fn start(&self) -> Result<()> {
        self.shared
            .transition_from(&[ConnectionState::Disconnected], ConnectionState::Initiating)?;
        if let Err(error) = self.gateway.deploy().await {
            self.shared.set_state(
                ConnectionState::Error,
                Some(format!("deploy request failed: {error:#}")),
            );
            return Ok(());
        }
        self.spawn_status_poll(StatusPollGoal {
            target: ChannelStatus::ReadyToScan,
            on_target: ConnectionState::ReadyToScan,
            interval: Duration::from_millis(self.config.poll_interval_ms),
            deadline: Some(Duration::from_millis(self.config.poll_timeout_ms)),
            timeout_message: format!(
                "channel did not become ready to scan within {} ms",
                self.config.poll_timeout_ms
            ),
        });
        Ok(())
    }

    /// `ready_to_scan` → `scanning`: fetches the pairing QR and starts the
    /// activation poll, the sole authority for the `scanning` → `active`
    /// transition. Returns the QR image bytes.
    pub async fn scan_now(&self) -> Result<Vec<u8>> {
        self.shared
            .transition_from(&[ConnectionState::ReadyToScan], ConnectionState::Scanning)?;
        let qr = match self.gateway.fetch_qr().await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.shared.set_state(
                    ConnectionState::Error,
                    Some(format!("qr fetch failed: {error:#}")),
                );
                return Err(error);
            }
        };
        self.spawn_status_poll(StatusPollGoal {
            target: ChannelStatus::Active,
            on_target: ConnectionState::Active,
            interval: Duration::from_millis(self.config.scan_poll_interval_ms),
            deadline: None,
            timeout_message: String::new(),
        });
        Ok(qr)
    }

    /// Closes the QR dialog: stops the activation poll and forces one status
    /// refresh, which resolves `scanning` to whatever the provider reports.
    pub async fn finish_scan(&self) -> ConnectionSnapshot {
        match self.shared.state() {
            ConnectionState::Scanning | ConnectionState::Active => {
                self.stop_status_poll();
                self.refresh_status(true).await
            }
            _ => self.shared.snapshot(),
        }
    }

    /// `active` → `disconnecting` (also the cancel path out of
    /// `ready_to_scan`): issues the provider disconnect and starts the
    /// bounded disconnected poll.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.transition_from(
            &[ConnectionState::Active, ConnectionState::ReadyToScan],
            ConnectionState::Disconnecting,
        )?;
        self.stop_status_poll();
        if let Err(error) = self.gateway.disconnect().await {
            self.shared.set_state(
                ConnectionState::Error,
                Some(format!("disconnect request failed: {error:#}")),
            );
            return Ok(());
        }
        self.spawn_status_poll(StatusPollGoal {
            target: ChannelStatus::Disconnected,
            on_target: ConnectionState::Disconnected,
            interval: Duration::from_millis(self.config.poll_interval_ms),
            deadline: Some(Duration::from_millis(self.config.poll_timeout_ms)),
            timeout_message: format!(
                "channel did not disconnect within {} ms",
                self.config.poll_timeout_ms
            ),
        });
        Ok(())
    }

    /// `error` → `disconnected`: the user acknowledged the failure.
    pub fn acknowledge_error(&self) -> Result<()> {
        self.shared
            .transition_from(&[ConnectionState::Error], ConnectionState::Disconnected)
    }

    /// Probes the provider and converges the local state on the reading.
    ///
    /// Unforced refreshes are suppressed while a transition is in flight and
    /// degrade transport failures to `disconnected`; forced refreshes bypass
    /// the busy guard and surface transport failures as `error`.
    pub async fn refresh_status(&self, force: bool) -> ConnectionSnapshot {
        if !force && self.shared.state().is_busy() {
            return self.shared.snapshot();
        }
        match self.gateway.probe_status().await {
            Ok(status) => {
                self.shared.stamp_checked();
                let next = match status {
                    ChannelStatus::Active => ConnectionState::Active,
                    ChannelStatus::ReadyToScan => ConnectionState::ReadyToScan,
                    ChannelStatus::Disconnected => ConnectionState::Disconnected,
                };
                self.shared.set_state(next, None);
            }
            Err(error) => {
                self.shared.stamp_checked();
                if force {
                    self.shared.set_state(
                        ConnectionState::Error,
                        Some(format!("status check failed: {error}")),
                    );
                } else {
                    self.shared.set_state(ConnectionState::Disconnected, None);
                }
            }
        }
        self.shared.snapshot()
    }

    fn spawn_status_poll(&self, goal: StatusPollGoal) {
        // One outstanding poll per controller: the previous loop must be
        // gone before the next one starts, or a transition could fire twice.
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            let _ = previous.cancel_tx.send(true);
            previous.handle.abort();
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gateway = Arc::clone(&self.gateway);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_status_poll(gateway, shared, cancel_rx, goal));
        *slot = Some(PollTask { cancel_tx, handle });
    }

    fn stop_status_poll(&self) {
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            let _ = previous.cancel_tx.send(true);
            previous.handle.abort();
        }
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.stop_status_poll();
    }
}
