#![allow(dead_code)]

use app_volume_lib::audio::tap::{
    AggregateDeviceSpec, AudioObjectId, IoProcHandle, OsStatusError, OutputDevice, ProcessId,
    TapBackend, TapProcessor,
};
use app_volume_lib::config::{SupervisorConfig, TapConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Offset between a pid and the process object the fake resolves it to
const PROCESS_OBJECT_BASE: u32 = 10_000;

/// Activation steps that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateTap,
    CreateAggregate,
    CreateIoProc,
    Start,
}

#[derive(Default)]
struct FakeState {
    live_taps: HashMap<u32, ProcessId>,
    live_aggregates: HashMap<u32, ProcessId>,
    io_procs: HashMap<u64, (u32, Arc<TapProcessor>)>,
    running: HashSet<u64>,
    specs: Vec<AggregateDeviceSpec>,
    pending_failures: HashMap<Step, u32>,
    unresolvable: HashSet<ProcessId>,
    exited: HashSet<ProcessId>,
    resolve_calls: HashMap<ProcessId, u32>,
    log: Vec<String>,
}

/// Scripted in-memory stand-in for Core Audio
pub struct FakeBackend {
    supported: bool,
    output: Mutex<Option<OutputDevice>>,
    stream_count: AtomicU32,
    sample_rate: Mutex<Option<f64>>,
    next_object: AtomicU32,
    next_io_proc: AtomicU64,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_support(true))
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self::with_support(false))
    }

    fn with_support(supported: bool) -> Self {
        Self {
            supported,
            output: Mutex::new(Some(OutputDevice {
                id: AudioObjectId(73),
                uid: "BuiltInSpeakerDevice".to_string(),
            })),
            stream_count: AtomicU32::new(2),
            sample_rate: Mutex::new(Some(48_000.0)),
            next_object: AtomicU32::new(100),
            next_io_proc: AtomicU64::new(1),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make the next `times` calls of `step` fail
    pub fn fail_next(&self, step: Step, times: u32) {
        self.state().pending_failures.insert(step, times);
    }

    pub fn set_unresolvable(&self, pid: ProcessId) {
        self.state().unresolvable.insert(pid);
    }

    pub fn set_exited(&self, pid: ProcessId) {
        self.state().exited.insert(pid);
    }

    /// A new process came up under a previously exited pid
    pub fn set_running(&self, pid: ProcessId) {
        self.state().exited.remove(&pid);
    }

    pub fn set_resolvable(&self, pid: ProcessId) {
        self.state().unresolvable.remove(&pid);
    }

    pub fn set_output(&self, output: Option<OutputDevice>) {
        *self.output.lock().unwrap() = output;
    }

    pub fn set_stream_count(&self, count: u32) {
        self.stream_count.store(count, Ordering::SeqCst);
    }

    pub fn set_sample_rate(&self, rate: Option<f64>) {
        *self.sample_rate.lock().unwrap() = rate;
    }

    pub fn live_taps(&self) -> usize {
        self.state().live_taps.len()
    }

    pub fn live_aggregates(&self) -> usize {
        self.state().live_aggregates.len()
    }

    pub fn live_io_procs(&self) -> usize {
        self.state().io_procs.len()
    }

    pub fn running_devices(&self) -> usize {
        self.state().running.len()
    }

    pub fn live_resources(&self) -> usize {
        let state = self.state();
        state.live_taps.len() + state.live_aggregates.len() + state.io_procs.len()
    }

    pub fn resolve_calls(&self, pid: ProcessId) -> u32 {
        self.state().resolve_calls.get(&pid).copied().unwrap_or(0)
    }

    pub fn aggregate_specs(&self) -> Vec<AggregateDeviceSpec> {
        self.state().specs.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Processor of the running I/O callback for `pid`, if any
    pub fn processor_for(&self, pid: ProcessId) -> Option<Arc<TapProcessor>> {
        let state = self.state();
        state
            .io_procs
            .iter()
            .filter(|(handle, _)| state.running.contains(handle))
            .find(|(_, (device, _))| state.live_aggregates.get(device) == Some(&pid))
            .map(|(_, (_, processor))| Arc::clone(processor))
    }

    /// Run one I/O cycle on `pid`'s callback, as the audio thread would
    pub fn drive(&self, pid: ProcessId, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> bool {
        match self.processor_for(pid) {
            Some(processor) => {
                processor.process(inputs, outputs);
                true
            }
            None => false,
        }
    }

    fn should_fail(&self, step: Step) -> bool {
        let mut state = self.state();
        match state.pending_failures.get_mut(&step) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn next_object(&self) -> u32 {
        self.next_object.fetch_add(1, Ordering::SeqCst)
    }
}

impl TapBackend for FakeBackend {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn resolve_process(&self, pid: ProcessId) -> Option<AudioObjectId> {
        let mut state = self.state();
        *state.resolve_calls.entry(pid).or_insert(0) += 1;
        if state.unresolvable.contains(&pid) || state.exited.contains(&pid) {
            return None;
        }
        Some(AudioObjectId(PROCESS_OBJECT_BASE + pid))
    }

    fn create_process_tap(&self, process: AudioObjectId) -> Result<AudioObjectId, OsStatusError> {
        if self.should_fail(Step::CreateTap) {
            return Err(OsStatusError::new("AudioHardwareCreateProcessTap", -50));
        }
        let tap = self.next_object();
        let mut state = self.state();
        state.live_taps.insert(tap, process.0 - PROCESS_OBJECT_BASE);
        state.log.push(format!("create_tap {}", tap));
        Ok(AudioObjectId(tap))
    }

    fn destroy_process_tap(&self, tap: AudioObjectId) -> Result<(), OsStatusError> {
        let mut state = self.state();
        state.log.push(format!("destroy_tap {}", tap));
        match state.live_taps.remove(&tap.0) {
            Some(_) => Ok(()),
            None => Err(OsStatusError::new("AudioHardwareDestroyProcessTap", 560947818)),
        }
    }

    fn default_output_device(&self) -> Option<OutputDevice> {
        self.output.lock().unwrap().clone()
    }

    fn create_aggregate_device(
        &self,
        spec: &AggregateDeviceSpec,
    ) -> Result<AudioObjectId, OsStatusError> {
        if self.should_fail(Step::CreateAggregate) {
            return Err(OsStatusError::new("AudioHardwareCreateAggregateDevice", -50));
        }
        let device = self.next_object();
        let mut state = self.state();
        let pid = state.live_taps.get(&spec.tap.0).copied().unwrap_or_default();
        state.live_aggregates.insert(device, pid);
        state.specs.push(spec.clone());
        state.log.push(format!("create_aggregate {}", device));
        Ok(AudioObjectId(device))
    }

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> Result<(), OsStatusError> {
        let mut state = self.state();
        state.log.push(format!("destroy_aggregate {}", device));
        match state.live_aggregates.remove(&device.0) {
            Some(_) => Ok(()),
            None => Err(OsStatusError::new(
                "AudioHardwareDestroyAggregateDevice",
                560947818,
            )),
        }
    }

    fn active_stream_count(&self, _device: AudioObjectId) -> Result<u32, OsStatusError> {
        Ok(self.stream_count.load(Ordering::SeqCst))
    }

    fn nominal_sample_rate(&self, _device: AudioObjectId) -> Option<f64> {
        *self.sample_rate.lock().unwrap()
    }

    fn create_io_proc(
        &self,
        device: AudioObjectId,
        processor: Arc<TapProcessor>,
    ) -> Result<IoProcHandle, OsStatusError> {
        if self.should_fail(Step::CreateIoProc) {
            return Err(OsStatusError::new("AudioDeviceCreateIOProcID", -50));
        }
        let handle = IoProcHandle(self.next_io_proc.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state();
        state.io_procs.insert(handle.0, (device.0, processor));
        state.log.push(format!("create_io_proc {}", handle.0));
        Ok(handle)
    }

    fn start_device(&self, _device: AudioObjectId, io_proc: IoProcHandle) -> Result<(), OsStatusError> {
        if self.should_fail(Step::Start) {
            return Err(OsStatusError::new("AudioDeviceStart", 1852797029));
        }
        let mut state = self.state();
        state.running.insert(io_proc.0);
        state.log.push(format!("start {}", io_proc.0));
        Ok(())
    }

    fn stop_device(&self, _device: AudioObjectId, io_proc: IoProcHandle) -> Result<(), OsStatusError> {
        let mut state = self.state();
        state.running.remove(&io_proc.0);
        state.log.push(format!("stop {}", io_proc.0));
        Ok(())
    }

    fn destroy_io_proc(
        &self,
        _device: AudioObjectId,
        io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        let mut state = self.state();
        state.log.push(format!("destroy_io_proc {}", io_proc.0));
        state.running.remove(&io_proc.0);
        match state.io_procs.remove(&io_proc.0) {
            Some(_) => Ok(()),
            None => Err(OsStatusError::new("AudioDeviceDestroyIOProcID", 560947818)),
        }
    }

    fn process_exists(&self, pid: ProcessId) -> bool {
        !self.state().exited.contains(&pid)
    }
}

/// Tap settings with short readiness bounds so failure paths stay fast
pub fn test_tap_config() -> TapConfig {
    TapConfig {
        readiness_timeout_ms: 100,
        readiness_poll_interval_ms: 5,
        ..TapConfig::default()
    }
}

/// Supervisor settings with short recovery delays and no background pruning
pub fn test_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        tap: test_tap_config(),
        settle_delay_ms: 10,
        max_recreate_attempts: 3,
        recreate_backoff_ms: 5,
        prune_interval_ms: 0,
    }
}

/// Poll until `condition` holds; teardown happens on the blocking pool
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Interleaved stereo buffer with every sample set to `value`
pub fn constant_buffer(frames: usize, value: f32) -> Vec<f32> {
    vec![value; frames * 2]
}
