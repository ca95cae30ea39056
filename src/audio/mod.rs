// Audio module - per-process volume control
//
// - tap: process taps, the real-time gain stage, and the supervisor
// - devices: default output device change notifications

pub mod devices;
pub mod tap;

pub use devices::{DefaultDeviceNotifier, DeviceChangeEvent};
pub use tap::{
    platform_backend, ProcessId, ProcessTap, TapBackend, TapController, TapError, TapEvent,
    TapState, TapStats, TapSupervisor,
};
