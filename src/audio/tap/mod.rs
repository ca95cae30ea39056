// Audio tap module - per-process audio interception and gain
//
// A `TapController` intercepts one process's output through a Core Audio
// process tap, mixes it back into the real output device through a private
// aggregate device, and applies volume, mute and limiting in the device's
// real-time callback. `TapSupervisor` owns every controller and rebuilds
// them when the default output device changes.
pub mod backend;
pub mod controller;
pub mod gain;
pub mod persistence;
pub mod processing;
pub mod supervisor;
pub mod types;

// Platform-specific modules
#[cfg(target_os = "macos")]
pub mod core_audio_backend;

// FFI bindings for Core Audio Taps API
#[cfg(target_os = "macos")]
pub mod core_audio_bindings;

// Re-export commonly used types
pub use types::{
    format_osstatus_error, AggregateDeviceSpec, AudioObjectId, IoProcHandle, OsStatusError,
    OutputDevice, ProcessId, Result, TapError, TapHandles, TapState, TapStats,
};

pub use backend::{platform_backend, TapBackend, UnsupportedBackend};
pub use controller::{NoopTap, ProcessTap, TapController};
pub use gain::{clamp_volume, GainState, MAX_VOLUME, MIN_VOLUME, UNITY_VOLUME};
pub use persistence::{MemoryStateStore, TapStateStore};
pub use processing::TapProcessor;
pub use supervisor::{RecoveryPhase, TapEvent, TapSupervisor};

#[cfg(target_os = "macos")]
pub use core_audio_backend::CoreAudioBackend;
