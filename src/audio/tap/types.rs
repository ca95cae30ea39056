// Audio tap type definitions and shared structures
//
// This module provides the identifiers, OS handles and error taxonomy shared
// by the tap controller, the OS backends and the supervisor.

use std::fmt;

/// Operating-system process identifier of a tapped application
pub type ProcessId = u32;

/// Core Audio object identifier (process object, tap, or device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AudioObjectId(pub u32);

impl fmt::Display for AudioObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token for an I/O callback registered on an aggregate device.
/// Backends hand out a fresh token per registration and never reuse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoProcHandle(pub u64);

/// The real output device a tap is mixed back into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDevice {
    pub id: AudioObjectId,
    pub uid: String,
}

/// Description handed to the backend when synthesizing the aggregate device
#[derive(Debug, Clone)]
pub struct AggregateDeviceSpec {
    pub name: String,
    pub uid: String,
    pub output: OutputDevice,
    pub tap: AudioObjectId,
    pub private: bool,
    pub drift_compensation: bool,
    pub tap_auto_start: bool,
}

/// Every live OS resource making up one activated tap
#[derive(Debug, Clone)]
pub struct TapHandles {
    pub process_object: AudioObjectId,
    pub tap: AudioObjectId,
    pub aggregate_device: AudioObjectId,
    pub io_proc: IoProcHandle,
}

/// Volume and mute state as exchanged with the persistence collaborator
/// and captured during device-change recovery
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TapState {
    pub volume: f32,
    pub muted: bool,
}

impl TapState {
    pub const UNITY: TapState = TapState {
        volume: 1.0,
        muted: false,
    };

    /// Whether applying this state would change anything on an untouched process
    pub fn is_default(&self) -> bool {
        self.volume == 1.0 && !self.muted
    }
}

impl Default for TapState {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Statistics for monitoring tap health
#[derive(Debug, Clone, serde::Serialize)]
pub struct TapStats {
    pub pid: ProcessId,
    pub activated: bool,
    pub supported: bool,
    pub volume: f32,
    pub current_volume: f32,
    pub muted: bool,
    pub peak_level: f32,
    pub callback_count: u64,
    pub age: std::time::Duration,
}

/// A failed OS call: which operation and the raw OSStatus it returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsStatusError {
    pub operation: &'static str,
    pub status: i32,
}

impl OsStatusError {
    pub fn new(operation: &'static str, status: i32) -> Self {
        Self { operation, status }
    }
}

impl fmt::Display for OsStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {}",
            self.operation,
            format_osstatus_error(self.status)
        )
    }
}

impl std::error::Error for OsStatusError {}

/// Errors that can occur while activating or supervising a process tap.
/// Every error is scoped to a single process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TapError {
    #[error("Process {pid} has no active audio object")]
    Resolution { pid: ProcessId },

    #[error("Failed to create process tap for PID {pid}: {source}")]
    DeviceCreation {
        pid: ProcessId,
        #[source]
        source: OsStatusError,
    },

    #[error("No default output device available")]
    NoOutputDevice,

    #[error("Failed to create aggregate device for PID {pid}: {source}")]
    AggregateCreation {
        pid: ProcessId,
        #[source]
        source: OsStatusError,
    },

    #[error("Aggregate device for PID {pid} reported no active stream within {waited_ms} ms")]
    ReadinessTimeout { pid: ProcessId, waited_ms: u64 },

    #[error("Failed to register I/O callback for PID {pid}: {source}")]
    CallbackRegistration {
        pid: ProcessId,
        #[source]
        source: OsStatusError,
    },

    #[error("Failed to start aggregate device for PID {pid}: {source}")]
    Start {
        pid: ProcessId,
        #[source]
        source: OsStatusError,
    },

    #[error("Tap supervisor is no longer running")]
    SupervisorClosed,
}

impl TapError {
    /// OS rejections during activation may succeed on a later attempt;
    /// a missing process object or output device will not until the
    /// environment changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TapError::DeviceCreation { .. }
                | TapError::AggregateCreation { .. }
                | TapError::ReadinessTimeout { .. }
                | TapError::CallbackRegistration { .. }
                | TapError::Start { .. }
        )
    }
}

/// Convert OSStatus error codes to human-readable messages
pub fn format_osstatus_error(status: i32) -> String {
    match status {
        0 => "No error".to_string(),
        1852797029 => "Audio hardware not running".to_string(),
        2003329396 => "Audio hardware unspecified error".to_string(),
        2003332927 => "Audio hardware unknown property error".to_string(),
        560947818 => "Audio hardware bad object error".to_string(),
        560227702 => "Audio hardware bad device error".to_string(),
        1937010544 => "Audio hardware not running error".to_string(),
        -50 => "Parameter error".to_string(),
        -4 => "Unimplemented error".to_string(),
        _ => format!("Unknown OSStatus error: {}", status),
    }
}

pub type Result<T> = std::result::Result<T, TapError>;
