// Tap controller: one intercepted process, end to end
//
// A controller owns the process tap, the private aggregate device that mixes
// the tap back into the real output device, and the I/O callback running the
// gain pipeline. Activation is all-or-nothing; teardown happens off the
// calling thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::TapBackend;
use super::gain::GainState;
use super::processing::TapProcessor;
use super::types::{
    AggregateDeviceSpec, AudioObjectId, IoProcHandle, OutputDevice, ProcessId, Result, TapError,
    TapHandles, TapState, TapStats,
};
use crate::audio_debug;
use crate::config::TapConfig;

/// Manages the Core Audio tap for a single process
pub struct TapController {
    pid: ProcessId,
    backend: Arc<dyn TapBackend>,
    config: TapConfig,
    gain: Arc<GainState>,
    tap: Option<TapHandles>,
    created_at: Instant,
}

impl TapController {
    pub fn new(pid: ProcessId, backend: Arc<dyn TapBackend>, config: TapConfig) -> Self {
        Self {
            pid,
            backend,
            config,
            gain: Arc::new(GainState::new()),
            tap: None,
            created_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn is_activated(&self) -> bool {
        self.tap.is_some()
    }

    /// OS handles of the live tap, if activated
    pub fn handles(&self) -> Option<&TapHandles> {
        self.tap.as_ref()
    }

    /// Build the interception path and start the real-time callback.
    ///
    /// Every resource created before a failing step is destroyed again, in
    /// reverse order, before the error is returned. Calling this on an
    /// activated controller does nothing.
    pub async fn activate(&mut self) -> Result<()> {
        if self.tap.is_some() {
            return Ok(());
        }

        let pid = self.pid;
        let backend = Arc::clone(&self.backend);
        info!(
            "{} Activating tap for PID {}",
            "TAP_ACTIVATE".bright_cyan(),
            pid
        );

        let process_object = backend
            .resolve_process(pid)
            .ok_or(TapError::Resolution { pid })?;
        audio_debug!("PID {} resolved to process object {}", pid, process_object);

        let mut pending = PendingTap::new(Arc::clone(&backend), pid);

        let tap = backend
            .create_process_tap(process_object)
            .map_err(|source| TapError::DeviceCreation { pid, source })?;
        pending.tap = Some(tap);
        audio_debug!("Created process tap {} for PID {}", tap, pid);

        let output = backend
            .default_output_device()
            .ok_or(TapError::NoOutputDevice)?;

        let spec = self.aggregate_spec(tap, output);
        let aggregate = backend
            .create_aggregate_device(&spec)
            .map_err(|source| TapError::AggregateCreation { pid, source })?;
        pending.aggregate = Some(aggregate);
        audio_debug!(
            "Created aggregate device {} ('{}') on output '{}'",
            aggregate,
            spec.uid,
            spec.output.uid
        );

        wait_until_ready(&*backend, &self.config, pid, aggregate).await?;

        let sample_rate = backend
            .nominal_sample_rate(aggregate)
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .unwrap_or(self.config.fallback_sample_rate);

        // A new callback starts at the target gain instead of ramping to it
        self.gain.snap_to_target();
        let processor = Arc::new(TapProcessor::new(
            Arc::clone(&self.gain),
            sample_rate,
            &self.config,
        ));

        let io_proc = backend
            .create_io_proc(aggregate, processor)
            .map_err(|source| TapError::CallbackRegistration { pid, source })?;
        pending.io_proc = Some(io_proc);

        backend
            .start_device(aggregate, io_proc)
            .map_err(|source| TapError::Start { pid, source })?;

        let handles = pending.commit(process_object, tap, aggregate, io_proc);
        info!(
            "{} Tap live for PID {}: tap {}, aggregate {}, {:.0} Hz",
            "TAP_ACTIVE".bright_green(),
            pid,
            handles.tap,
            handles.aggregate_device,
            sample_rate
        );
        self.tap = Some(handles);
        Ok(())
    }

    /// Tear the tap down. State is cleared immediately; the OS calls run on
    /// the blocking pool (or a plain thread outside a runtime). The returned
    /// handle may be awaited but callers are free to drop it.
    pub fn invalidate(&mut self) -> Option<JoinHandle<()>> {
        let handles = self.tap.take()?;
        let backend = Arc::clone(&self.backend);
        let pid = self.pid;

        info!(
            "{} Invalidating tap for PID {}",
            "TAP_INVALIDATE".bright_yellow(),
            pid
        );

        let teardown = move || teardown_tap(&*backend, pid, &handles);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn_blocking(teardown)),
            Err(_) => {
                std::thread::spawn(teardown);
                None
            }
        }
    }

    pub fn volume(&self) -> f32 {
        self.gain.target_volume()
    }

    /// Clamped to 0.0..=2.0; returns the stored value
    pub fn set_volume(&self, volume: f32) -> f32 {
        self.gain.set_target_volume(volume)
    }

    pub fn is_muted(&self) -> bool {
        self.gain.is_muted()
    }

    pub fn set_muted(&self, muted: bool) {
        self.gain.set_muted(muted);
    }

    /// Smoothed peak of the intercepted stream, 0.0..=1.0
    pub fn peak_level(&self) -> f32 {
        self.gain.peak_level()
    }

    /// Gain currently applied by the audio thread
    pub fn current_volume(&self) -> f32 {
        self.gain.current_volume()
    }

    pub fn gain(&self) -> &Arc<GainState> {
        &self.gain
    }

    pub fn snapshot(&self) -> TapState {
        self.gain.snapshot()
    }

    pub fn restore(&self, state: TapState) {
        self.gain.restore(state);
    }

    pub fn stats(&self) -> TapStats {
        TapStats {
            pid: self.pid,
            activated: self.is_activated(),
            supported: true,
            volume: self.volume(),
            current_volume: self.current_volume(),
            muted: self.is_muted(),
            peak_level: self.peak_level(),
            callback_count: self.gain.callback_count(),
            age: self.created_at.elapsed(),
        }
    }

    fn aggregate_spec(&self, tap: AudioObjectId, output: OutputDevice) -> AggregateDeviceSpec {
        // A fresh UID per activation: a device still being torn down from a
        // previous activation must never be picked up again.
        let uid = format!(
            "{}.{}.{}",
            self.config.aggregate_uid_prefix,
            self.pid,
            uuid::Uuid::new_v4()
        );
        AggregateDeviceSpec {
            name: format!("AppVolume-Tap-{}", self.pid),
            uid,
            output,
            tap,
            private: true,
            drift_compensation: false,
            tap_auto_start: true,
        }
    }
}

impl Drop for TapController {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for TapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapController")
            .field("pid", &self.pid)
            .field("tap", &self.tap)
            .field("volume", &self.volume())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Poll the aggregate device until it reports a stream or the timeout passes
async fn wait_until_ready(
    backend: &dyn TapBackend,
    config: &TapConfig,
    pid: ProcessId,
    device: AudioObjectId,
) -> Result<()> {
    let started = Instant::now();
    let timeout = config.readiness_timeout();
    let poll_interval = config.readiness_poll_interval();

    loop {
        match backend.active_stream_count(device) {
            Ok(count) if count > 0 => {
                audio_debug!(
                    "Aggregate device {} ready with {} stream(s) after {:?}",
                    device,
                    count,
                    started.elapsed()
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!("Stream query on aggregate device {} failed: {}", device, e),
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(
                "Aggregate device {} for PID {} never reported a stream",
                device, pid
            );
            return Err(TapError::ReadinessTimeout {
                pid,
                waited_ms: duration_ms(elapsed),
            });
        }
        tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Stop the callback, then destroy the callback, aggregate device and tap
fn teardown_tap(backend: &dyn TapBackend, pid: ProcessId, handles: &TapHandles) {
    if let Err(e) = backend.stop_device(handles.aggregate_device, handles.io_proc) {
        warn!("Failed to stop aggregate device for PID {}: {}", pid, e);
    }
    if let Err(e) = backend.destroy_io_proc(handles.aggregate_device, handles.io_proc) {
        warn!("Failed to destroy I/O callback for PID {}: {}", pid, e);
    }
    if let Err(e) = backend.destroy_aggregate_device(handles.aggregate_device) {
        warn!("Failed to destroy aggregate device for PID {}: {}", pid, e);
    }
    if let Err(e) = backend.destroy_process_tap(handles.tap) {
        warn!("Failed to destroy process tap for PID {}: {}", pid, e);
    }
    debug!("Tap teardown complete for PID {}", pid);
}

/// Resources created so far by an in-flight activation. Dropping it without
/// `commit` rolls them back in reverse order.
struct PendingTap {
    backend: Arc<dyn TapBackend>,
    pid: ProcessId,
    tap: Option<AudioObjectId>,
    aggregate: Option<AudioObjectId>,
    io_proc: Option<IoProcHandle>,
}

impl PendingTap {
    fn new(backend: Arc<dyn TapBackend>, pid: ProcessId) -> Self {
        Self {
            backend,
            pid,
            tap: None,
            aggregate: None,
            io_proc: None,
        }
    }

    fn commit(
        mut self,
        process_object: AudioObjectId,
        tap: AudioObjectId,
        aggregate_device: AudioObjectId,
        io_proc: IoProcHandle,
    ) -> TapHandles {
        self.tap = None;
        self.aggregate = None;
        self.io_proc = None;
        TapHandles {
            process_object,
            tap,
            aggregate_device,
            io_proc,
        }
    }
}

impl Drop for PendingTap {
    fn drop(&mut self) {
        if self.tap.is_none() {
            return;
        }
        warn!(
            "{} Rolling back partial tap for PID {}",
            "TAP_ROLLBACK".bright_red(),
            self.pid
        );

        if let (Some(device), Some(io_proc)) = (self.aggregate, self.io_proc.take()) {
            if let Err(e) = self.backend.destroy_io_proc(device, io_proc) {
                warn!("Rollback: failed to destroy I/O callback: {}", e);
            }
        }
        if let Some(device) = self.aggregate.take() {
            if let Err(e) = self.backend.destroy_aggregate_device(device) {
                warn!("Rollback: failed to destroy aggregate device {}: {}", device, e);
            }
        }
        if let Some(tap) = self.tap.take() {
            if let Err(e) = self.backend.destroy_process_tap(tap) {
                warn!("Rollback: failed to destroy process tap {}: {}", tap, e);
            }
        }
    }
}

/// Stand-in used where process taps are unavailable: accepts every command,
/// never touches the OS, always reads silent.
#[derive(Debug)]
pub struct NoopTap {
    pid: ProcessId,
    state: TapState,
    created_at: Instant,
}

impl NoopTap {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            state: TapState::UNITY,
            created_at: Instant::now(),
        }
    }
}

/// A process's tap as held by the supervisor: the full controller when the
/// host supports process taps, the no-op stand-in otherwise
#[derive(Debug)]
pub enum ProcessTap {
    Live(TapController),
    Unsupported(NoopTap),
}

impl ProcessTap {
    /// Capability-checked factory
    pub fn new(pid: ProcessId, backend: Arc<dyn TapBackend>, config: TapConfig) -> Self {
        if backend.is_supported() {
            ProcessTap::Live(TapController::new(pid, backend, config))
        } else {
            debug!("Process taps unsupported, using no-op tap for PID {}", pid);
            ProcessTap::Unsupported(NoopTap::new(pid))
        }
    }

    pub fn pid(&self) -> ProcessId {
        match self {
            ProcessTap::Live(controller) => controller.pid(),
            ProcessTap::Unsupported(noop) => noop.pid,
        }
    }

    pub async fn activate(&mut self) -> Result<()> {
        match self {
            ProcessTap::Live(controller) => controller.activate().await,
            ProcessTap::Unsupported(_) => Ok(()),
        }
    }

    pub fn invalidate(&mut self) -> Option<JoinHandle<()>> {
        match self {
            ProcessTap::Live(controller) => controller.invalidate(),
            ProcessTap::Unsupported(_) => None,
        }
    }

    pub fn is_activated(&self) -> bool {
        match self {
            ProcessTap::Live(controller) => controller.is_activated(),
            ProcessTap::Unsupported(_) => true,
        }
    }

    pub fn volume(&self) -> f32 {
        match self {
            ProcessTap::Live(controller) => controller.volume(),
            ProcessTap::Unsupported(noop) => noop.state.volume,
        }
    }

    pub fn set_volume(&mut self, volume: f32) -> f32 {
        match self {
            ProcessTap::Live(controller) => controller.set_volume(volume),
            ProcessTap::Unsupported(noop) => {
                noop.state.volume = super::gain::clamp_volume(volume);
                noop.state.volume
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        match self {
            ProcessTap::Live(controller) => controller.is_muted(),
            ProcessTap::Unsupported(noop) => noop.state.muted,
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        match self {
            ProcessTap::Live(controller) => controller.set_muted(muted),
            ProcessTap::Unsupported(noop) => noop.state.muted = muted,
        }
    }

    pub fn peak_level(&self) -> f32 {
        match self {
            ProcessTap::Live(controller) => controller.peak_level(),
            ProcessTap::Unsupported(_) => 0.0,
        }
    }

    pub fn snapshot(&self) -> TapState {
        match self {
            ProcessTap::Live(controller) => controller.snapshot(),
            ProcessTap::Unsupported(noop) => noop.state,
        }
    }

    pub fn restore(&mut self, state: TapState) {
        self.set_volume(state.volume);
        self.set_muted(state.muted);
    }

    pub fn stats(&self) -> TapStats {
        match self {
            ProcessTap::Live(controller) => controller.stats(),
            ProcessTap::Unsupported(noop) => TapStats {
                pid: noop.pid,
                activated: true,
                supported: false,
                volume: noop.state.volume,
                current_volume: noop.state.volume,
                muted: noop.state.muted,
                peak_level: 0.0,
                callback_count: 0,
                age: noop.created_at.elapsed(),
            },
        }
    }
}
