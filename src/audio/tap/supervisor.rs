// Tap supervisor - owns every active process tap
//
// All mutating work (volume and mute commands, removal, pruning and
// device-change recovery) is funnelled onto a single worker task through an
// unbounded command channel, so commands for a process apply in the order
// they were issued and nothing can touch a tap while recovery is rebuilding
// it. The real-time audio threads never go through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::TapBackend;
use super::controller::ProcessTap;
use super::gain::clamp_volume;
use super::persistence::TapStateStore;
use super::types::{ProcessId, Result, TapError, TapState, TapStats};
use crate::audio::devices::notifications::DeviceChangeEvent;
use crate::config::SupervisorConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for the application layer and the persistence collaborator
#[derive(Debug, Clone)]
pub enum TapEvent {
    /// A volume command succeeded; `volume` is the clamped value in effect
    VolumeChanged {
        pid: ProcessId,
        identity: Option<String>,
        volume: f32,
    },
    MuteChanged {
        pid: ProcessId,
        identity: Option<String>,
        muted: bool,
    },
    TapRemoved { pid: ProcessId },
    /// The tap's process exited and the tap was reclaimed
    TapPruned { pid: ProcessId },
    RecoveryStarted { taps: usize },
    Recovered { pid: ProcessId },
    /// Recreation gave up on this process; it is no longer controlled
    RecreationFailed {
        pid: ProcessId,
        attempts: u32,
        error: TapError,
    },
    RecoveryCompleted {
        restored: Vec<ProcessId>,
        dropped: Vec<ProcessId>,
    },
}

/// Device-change recovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Stable,
    Snapshotting,
    TornDown,
    Recreating,
}

/// Commands that address taps; handled one at a time outside recovery
enum TapRequest {
    SetVolume {
        pid: ProcessId,
        volume: f32,
        reply: oneshot::Sender<Result<f32>>,
    },
    SetMute {
        pid: ProcessId,
        muted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    GetLevel {
        pid: ProcessId,
        reply: oneshot::Sender<f32>,
    },
    RemoveTap {
        pid: ProcessId,
        reply: oneshot::Sender<bool>,
    },
    BindIdentity {
        pid: ProcessId,
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ActiveTaps {
        reply: oneshot::Sender<Vec<TapStats>>,
    },
    PruneExited {
        reply: Option<oneshot::Sender<Vec<ProcessId>>>,
    },
}

enum SupervisorCommand {
    Request(TapRequest),
    OutputDeviceChanged,
    Shutdown { reply: oneshot::Sender<()> },
}

impl From<TapRequest> for SupervisorCommand {
    fn from(request: TapRequest) -> Self {
        SupervisorCommand::Request(request)
    }
}

/// Cloneable handle to the supervisor's worker task
#[derive(Clone)]
pub struct TapSupervisor {
    command_tx: mpsc::UnboundedSender<SupervisorCommand>,
    events: broadcast::Sender<TapEvent>,
}

impl TapSupervisor {
    /// Start the supervisor. Must be called from within a Tokio runtime.
    pub fn spawn(backend: Arc<dyn TapBackend>, config: SupervisorConfig) -> Self {
        Self::spawn_inner(backend, config, None)
    }

    /// Start the supervisor with a persistence collaborator attached
    pub fn spawn_with_store(
        backend: Arc<dyn TapBackend>,
        config: SupervisorConfig,
        store: Arc<dyn TapStateStore>,
    ) -> Self {
        Self::spawn_inner(backend, config, Some(store))
    }

    fn spawn_inner(
        backend: Arc<dyn TapBackend>,
        config: SupervisorConfig,
        store: Option<Arc<dyn TapStateStore>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        if let Some(interval) = config.prune_interval() {
            let weak_tx = command_tx.downgrade();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(tx) = weak_tx.upgrade() else { break };
                    let prune = TapRequest::PruneExited { reply: None };
                    if tx.send(prune.into()).is_err() {
                        break;
                    }
                }
                debug!("Tap prune task stopped");
            });
        }

        let worker = SupervisorWorker {
            backend,
            config,
            store,
            events: events.clone(),
            taps: HashMap::new(),
            retained: HashMap::new(),
            identities: HashMap::new(),
            phase: RecoveryPhase::Stable,
            started_at: Instant::now(),
        };
        tokio::spawn(worker.run(command_rx));

        info!("{} Tap supervisor started", "SUPERVISOR".bright_cyan());
        Self { command_tx, events }
    }

    /// Set a process's volume (0.0..=2.0, clamped). Creates and activates a
    /// tap on demand unless the resulting state is unity gain and unmuted; a
    /// new tap starts at its previous state and ramps to the request.
    /// Returns the stored value.
    pub async fn set_volume(&self, pid: ProcessId, volume: f32) -> Result<f32> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::SetVolume { pid, volume, reply })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)?
    }

    /// Mute or unmute a process. Without a tap this only creates one when
    /// the resulting state is non-default.
    pub async fn set_mute(&self, pid: ProcessId, muted: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::SetMute { pid, muted, reply })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)?
    }

    /// Smoothed peak level of a process, 0.0 when it has no tap
    pub async fn get_level(&self, pid: ProcessId) -> f32 {
        let (reply, rx) = oneshot::channel();
        if self.send(TapRequest::GetLevel { pid, reply }).is_err() {
            return 0.0;
        }
        rx.await.unwrap_or(0.0)
    }

    /// Tear down a process's tap and drop its identity binding. Returns
    /// whether a tap existed.
    pub async fn remove_tap(&self, pid: ProcessId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::RemoveTap { pid, reply })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)
    }

    /// Associate a pid with a stable identifier for persistence. A stored
    /// non-default state is applied right away.
    pub async fn bind_identity(&self, pid: ProcessId, key: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::BindIdentity {
            pid,
            key: key.into(),
            reply,
        })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)?
    }

    /// Stats of every registered tap, sorted by pid
    pub async fn active_taps(&self) -> Result<Vec<TapStats>> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::ActiveTaps { reply })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)
    }

    /// Reclaim taps whose process has exited. Returns the pruned pids.
    pub async fn prune_exited(&self) -> Result<Vec<ProcessId>> {
        let (reply, rx) = oneshot::channel();
        self.send(TapRequest::PruneExited { reply: Some(reply) })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)
    }

    /// Queue device-change recovery. Commands sent afterwards are applied to
    /// the recreated taps.
    pub fn notify_output_device_changed(&self) -> Result<()> {
        self.send(SupervisorCommand::OutputDeviceChanged)
    }

    /// Forward default-output changes from a device notifier into the
    /// supervisor. The task ends when either side goes away.
    pub fn watch_device_changes(
        &self,
        mut device_events: mpsc::UnboundedReceiver<DeviceChangeEvent>,
    ) -> JoinHandle<()> {
        let weak_tx = self.command_tx.downgrade();
        tokio::spawn(async move {
            while let Some(event) = device_events.recv().await {
                let DeviceChangeEvent::DefaultOutputChanged { new_device_id, .. } = event;
                info!(
                    "{} Default output device changed to {}",
                    "DEVICE_CHANGE".bright_magenta(),
                    new_device_id
                );
                let Some(tx) = weak_tx.upgrade() else { break };
                if tx.send(SupervisorCommand::OutputDeviceChanged).is_err() {
                    break;
                }
            }
            debug!("Device change watcher stopped");
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TapEvent> {
        self.events.subscribe()
    }

    /// Tear down every tap, wait for the OS teardown, and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown { reply })?;
        rx.await.map_err(|_| TapError::SupervisorClosed)
    }

    fn send(&self, command: impl Into<SupervisorCommand>) -> Result<()> {
        self.command_tx
            .send(command.into())
            .map_err(|_| TapError::SupervisorClosed)
    }
}

/// State owned by the worker task. Only the worker mutates the registry.
struct SupervisorWorker {
    backend: Arc<dyn TapBackend>,
    config: SupervisorConfig,
    store: Option<Arc<dyn TapStateStore>>,
    events: broadcast::Sender<TapEvent>,
    taps: HashMap<ProcessId, ProcessTap>,
    /// Last state of taps that recovery had to drop, reapplied if the
    /// process is addressed again
    retained: HashMap<ProcessId, TapState>,
    identities: HashMap<ProcessId, String>,
    phase: RecoveryPhase,
    started_at: Instant,
}

impl SupervisorWorker {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<SupervisorCommand>) {
        let mut deferred: Option<SupervisorCommand> = None;

        loop {
            let command = match deferred.take() {
                Some(command) => command,
                None => match command_rx.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                SupervisorCommand::OutputDeviceChanged => {
                    // Collapse a burst of notifications into one recovery pass
                    while let Ok(next) = command_rx.try_recv() {
                        if !matches!(next, SupervisorCommand::OutputDeviceChanged) {
                            deferred = Some(next);
                            break;
                        }
                    }
                    self.recover_from_device_change().await;
                }
                SupervisorCommand::Shutdown { reply } => {
                    self.teardown_all().await;
                    let _ = reply.send(());
                    break;
                }
                SupervisorCommand::Request(request) => self.handle_request(request).await,
            }
        }

        self.teardown_all().await;
        info!(
            "{} Tap supervisor stopped after {:?}",
            "SUPERVISOR".bright_cyan(),
            self.started_at.elapsed()
        );
    }

    async fn handle_request(&mut self, request: TapRequest) {
        match request {
            TapRequest::SetVolume { pid, volume, reply } => {
                let result = self.set_volume(pid, volume).await;
                let _ = reply.send(result);
            }
            TapRequest::SetMute { pid, muted, reply } => {
                let result = self.set_mute(pid, muted).await;
                let _ = reply.send(result);
            }
            TapRequest::GetLevel { pid, reply } => {
                let level = self.taps.get(&pid).map_or(0.0, ProcessTap::peak_level);
                let _ = reply.send(level);
            }
            TapRequest::RemoveTap { pid, reply } => {
                let removed = self.remove_tap(pid);
                let _ = reply.send(removed);
            }
            TapRequest::BindIdentity { pid, key, reply } => {
                let result = self.bind_identity(pid, key).await;
                let _ = reply.send(result);
            }
            TapRequest::ActiveTaps { reply } => {
                let mut stats: Vec<TapStats> = self.taps.values().map(ProcessTap::stats).collect();
                stats.sort_by_key(|s| s.pid);
                let _ = reply.send(stats);
            }
            TapRequest::PruneExited { reply } => {
                let pruned = self.prune_exited();
                if let Some(reply) = reply {
                    let _ = reply.send(pruned);
                }
            }
        }
    }

    async fn set_volume(&mut self, pid: ProcessId, volume: f32) -> Result<f32> {
        let volume = clamp_volume(volume);

        let stored = match self.taps.get_mut(&pid) {
            Some(tap) => tap.set_volume(volume),
            None => {
                let initial = self.initial_state(pid);
                let desired = TapState { volume, ..initial };
                if desired.is_default() {
                    self.retained.remove(&pid);
                    volume
                } else {
                    self.create_tap(pid, initial, desired).await?.volume()
                }
            }
        };

        debug!("Volume for PID {} set to {:.2}", pid, stored);
        self.persist(pid);
        let _ = self.events.send(TapEvent::VolumeChanged {
            pid,
            identity: self.identities.get(&pid).cloned(),
            volume: stored,
        });
        Ok(stored)
    }

    async fn set_mute(&mut self, pid: ProcessId, muted: bool) -> Result<()> {
        match self.taps.get_mut(&pid) {
            Some(tap) => tap.set_muted(muted),
            None => {
                let initial = self.initial_state(pid);
                let desired = TapState { muted, ..initial };
                if desired.is_default() {
                    self.retained.remove(&pid);
                } else {
                    self.create_tap(pid, initial, desired).await?;
                }
            }
        }

        debug!("PID {} {}", pid, if muted { "muted" } else { "unmuted" });
        self.persist(pid);
        let _ = self.events.send(TapEvent::MuteChanged {
            pid,
            identity: self.identities.get(&pid).cloned(),
            muted,
        });
        Ok(())
    }

    /// Tear down the tap and forget everything known about the pid
    fn remove_tap(&mut self, pid: ProcessId) -> bool {
        self.forget(pid);
        match self.taps.remove(&pid) {
            Some(mut tap) => {
                tap.invalidate();
                info!("Removed tap for PID {}", pid);
                let _ = self.events.send(TapEvent::TapRemoved { pid });
                true
            }
            None => false,
        }
    }

    async fn bind_identity(&mut self, pid: ProcessId, key: String) -> Result<()> {
        debug!("PID {} bound to identity '{}'", pid, key);
        let stored = self.store.as_ref().and_then(|store| store.load(&key));
        self.identities.insert(pid, key);

        match stored {
            Some(state) if !state.is_default() && !self.taps.contains_key(&pid) => {
                info!(
                    "Restoring saved state for PID {}: volume {:.2}, muted {}",
                    pid, state.volume, state.muted
                );
                self.create_tap(pid, state, state).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Activate a new tap at `initial`, then move it to `desired` so the
    /// change ramps in like any other. Registered only on success.
    async fn create_tap(
        &mut self,
        pid: ProcessId,
        initial: TapState,
        desired: TapState,
    ) -> Result<&mut ProcessTap> {
        let mut tap = ProcessTap::new(pid, Arc::clone(&self.backend), self.config.tap.clone());
        tap.restore(initial);

        if let Err(e) = tap.activate().await {
            error!("Failed to create tap for PID {}: {}", pid, e);
            return Err(e);
        }
        tap.restore(desired);

        info!("{} Created tap for PID {}", "TAP_CREATED".bright_green(), pid);
        self.retained.remove(&pid);
        Ok(self.taps.entry(pid).or_insert(tap))
    }

    /// State a new tap for `pid` starts from: whatever recovery retained,
    /// else the saved state of its identity, else unity
    fn initial_state(&self, pid: ProcessId) -> TapState {
        if let Some(state) = self.retained.get(&pid) {
            return *state;
        }
        self.identities
            .get(&pid)
            .zip(self.store.as_ref())
            .and_then(|(key, store)| store.load(key))
            .unwrap_or(TapState::UNITY)
    }

    fn persist(&self, pid: ProcessId) {
        let (Some(store), Some(key)) = (self.store.as_ref(), self.identities.get(&pid)) else {
            return;
        };
        let state = self
            .taps
            .get(&pid)
            .map_or(TapState::UNITY, ProcessTap::snapshot);
        store.save(key, state);
    }

    fn forget(&mut self, pid: ProcessId) {
        if let Some(key) = self.identities.remove(&pid) {
            debug!("PID {} unbound from identity '{}'", pid, key);
        }
        self.retained.remove(&pid);
    }

    /// Reclaim taps of exited processes and drop identities and retained
    /// state of pids that are gone, so a reused pid starts clean. Returns
    /// the pids whose tap was reclaimed.
    fn prune_exited(&mut self) -> Vec<ProcessId> {
        let mut known: Vec<ProcessId> = self
            .taps
            .keys()
            .chain(self.identities.keys())
            .chain(self.retained.keys())
            .copied()
            .collect();
        known.sort_unstable();
        known.dedup();

        let mut pruned = Vec::new();
        for pid in known {
            if self.backend.process_exists(pid) {
                continue;
            }
            self.forget(pid);
            if let Some(mut tap) = self.taps.remove(&pid) {
                tap.invalidate();
                info!("Process {} exited, reclaimed its tap", pid);
                let _ = self.events.send(TapEvent::TapPruned { pid });
                pruned.push(pid);
            }
        }
        pruned
    }

    /// Snapshot -> tear down -> settle -> recreate with bounded retry -> restore
    async fn recover_from_device_change(&mut self) {
        if self.taps.is_empty() {
            debug!("Output device changed with no active taps");
            return;
        }

        info!(
            "{} Output device changed, recreating {} tap(s)",
            "TAP_RECOVERY".bright_magenta(),
            self.taps.len()
        );

        self.phase = RecoveryPhase::Snapshotting;
        let snapshots: HashMap<ProcessId, TapState> = self
            .taps
            .iter()
            .map(|(pid, tap)| (*pid, tap.snapshot()))
            .collect();
        let _ = self.events.send(TapEvent::RecoveryStarted {
            taps: snapshots.len(),
        });

        self.phase = RecoveryPhase::TornDown;
        for (_, mut tap) in self.taps.drain() {
            tap.invalidate();
        }
        tokio::time::sleep(self.config.settle_delay()).await;

        self.phase = RecoveryPhase::Recreating;
        let mut pids: Vec<ProcessId> = snapshots.keys().copied().collect();
        pids.sort_unstable();

        let mut restored = Vec::new();
        let mut dropped = Vec::new();
        for pid in pids {
            let state = snapshots[&pid];
            match self.recreate(pid, state).await {
                Ok(tap) => {
                    self.taps.insert(pid, tap);
                    restored.push(pid);
                    let _ = self.events.send(TapEvent::Recovered { pid });
                }
                Err(error) => {
                    warn!(
                        "{} Giving up on PID {} after {} attempts: {}",
                        "TAP_DROPPED".bright_red(),
                        pid,
                        self.config.max_recreate_attempts,
                        error
                    );
                    dropped.push(pid);
                    if let Some(key) = self.identities.remove(&pid) {
                        debug!("PID {} unbound from identity '{}'", pid, key);
                    }
                    self.retained.insert(pid, state);
                    let _ = self.events.send(TapEvent::RecreationFailed {
                        pid,
                        attempts: self.config.max_recreate_attempts,
                        error,
                    });
                }
            }
        }

        self.phase = RecoveryPhase::Stable;
        info!(
            "{} Recovery complete: {} restored, {} dropped",
            "TAP_RECOVERY".bright_magenta(),
            restored.len(),
            dropped.len()
        );
        let _ = self
            .events
            .send(TapEvent::RecoveryCompleted { restored, dropped });
    }

    async fn recreate(&self, pid: ProcessId, state: TapState) -> Result<ProcessTap> {
        debug_assert_eq!(self.phase, RecoveryPhase::Recreating);
        let attempts = self.config.max_recreate_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut tap =
                ProcessTap::new(pid, Arc::clone(&self.backend), self.config.tap.clone());
            // Restored before activation so the first buffer already plays
            // at the user's level
            tap.restore(state);

            match tap.activate().await {
                Ok(()) => {
                    info!("Recreated tap for PID {} (attempt {})", pid, attempt);
                    return Ok(tap);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Recreating tap for PID {} failed (attempt {}/{}, {}): {}",
                        pid,
                        attempt,
                        attempts,
                        if e.is_retryable() { "os rejection" } else { "environment" },
                        e
                    );
                    tokio::time::sleep(self.config.backoff_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn teardown_all(&mut self) {
        let handles: Vec<JoinHandle<()>> = self
            .taps
            .drain()
            .filter_map(|(_, mut tap)| tap.invalidate())
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Tap teardown task failed: {}", e);
            }
        }
    }
}
