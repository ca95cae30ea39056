// OS seam for process taps
//
// `TapController` drives activation and teardown entirely through this
// trait. The Core Audio implementation lives in `core_audio_backend`; tests
// drive the controller and supervisor with scripted backends.

use std::sync::Arc;

use super::processing::TapProcessor;
use super::types::{
    AggregateDeviceSpec, AudioObjectId, IoProcHandle, OsStatusError, OutputDevice, ProcessId,
};

/// Low-level operations needed to intercept one process and mix it back
/// into the output device. Every call is synchronous and may block briefly
/// on OS bookkeeping; none of them is ever invoked from the audio thread.
pub trait TapBackend: Send + Sync {
    /// Whether the host exposes per-process taps at all
    fn is_supported(&self) -> bool;

    /// Translate a pid to the OS audio process object, if it has one
    fn resolve_process(&self, pid: ProcessId) -> Option<AudioObjectId>;

    /// Create a stereo, interleaved, f32 mixdown tap of one process
    fn create_process_tap(&self, process: AudioObjectId) -> Result<AudioObjectId, OsStatusError>;

    fn destroy_process_tap(&self, tap: AudioObjectId) -> Result<(), OsStatusError>;

    /// Current system default output device, if any
    fn default_output_device(&self) -> Option<OutputDevice>;

    fn create_aggregate_device(
        &self,
        spec: &AggregateDeviceSpec,
    ) -> Result<AudioObjectId, OsStatusError>;

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> Result<(), OsStatusError>;

    /// Number of streams the device currently reports
    fn active_stream_count(&self, device: AudioObjectId) -> Result<u32, OsStatusError>;

    /// Nominal sample rate, when the device reports one
    fn nominal_sample_rate(&self, device: AudioObjectId) -> Option<f64>;

    /// Install the real-time callback that runs `processor` on every buffer
    fn create_io_proc(
        &self,
        device: AudioObjectId,
        processor: Arc<TapProcessor>,
    ) -> Result<IoProcHandle, OsStatusError>;

    fn start_device(&self, device: AudioObjectId, io_proc: IoProcHandle)
        -> Result<(), OsStatusError>;

    fn stop_device(&self, device: AudioObjectId, io_proc: IoProcHandle)
        -> Result<(), OsStatusError>;

    fn destroy_io_proc(
        &self,
        device: AudioObjectId,
        io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError>;

    /// Whether the process is still running
    fn process_exists(&self, pid: ProcessId) -> bool {
        use sysinfo::{Pid, System};

        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

/// Backend for hosts without process taps. Nothing can be created, so the
/// capability check routes every process to the no-op tap.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    const UNIMPLEMENTED: i32 = -4;

    fn unimplemented(operation: &'static str) -> OsStatusError {
        OsStatusError::new(operation, Self::UNIMPLEMENTED)
    }
}

impl TapBackend for UnsupportedBackend {
    fn is_supported(&self) -> bool {
        false
    }

    fn resolve_process(&self, _pid: ProcessId) -> Option<AudioObjectId> {
        None
    }

    fn create_process_tap(&self, _process: AudioObjectId) -> Result<AudioObjectId, OsStatusError> {
        Err(Self::unimplemented("AudioHardwareCreateProcessTap"))
    }

    fn destroy_process_tap(&self, _tap: AudioObjectId) -> Result<(), OsStatusError> {
        Ok(())
    }

    fn default_output_device(&self) -> Option<OutputDevice> {
        None
    }

    fn create_aggregate_device(
        &self,
        _spec: &AggregateDeviceSpec,
    ) -> Result<AudioObjectId, OsStatusError> {
        Err(Self::unimplemented("AudioHardwareCreateAggregateDevice"))
    }

    fn destroy_aggregate_device(&self, _device: AudioObjectId) -> Result<(), OsStatusError> {
        Ok(())
    }

    fn active_stream_count(&self, _device: AudioObjectId) -> Result<u32, OsStatusError> {
        Ok(0)
    }

    fn nominal_sample_rate(&self, _device: AudioObjectId) -> Option<f64> {
        None
    }

    fn create_io_proc(
        &self,
        _device: AudioObjectId,
        _processor: Arc<TapProcessor>,
    ) -> Result<IoProcHandle, OsStatusError> {
        Err(Self::unimplemented("AudioDeviceCreateIOProcID"))
    }

    fn start_device(
        &self,
        _device: AudioObjectId,
        _io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        Err(Self::unimplemented("AudioDeviceStart"))
    }

    fn stop_device(
        &self,
        _device: AudioObjectId,
        _io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        Ok(())
    }

    fn destroy_io_proc(
        &self,
        _device: AudioObjectId,
        _io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        Ok(())
    }
}

/// The backend for the current platform
pub fn platform_backend() -> Arc<dyn TapBackend> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(super::core_audio_backend::CoreAudioBackend::new())
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(UnsupportedBackend)
    }
}
