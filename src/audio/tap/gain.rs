// Lock-free gain state shared between the command context and the
// real-time audio thread.
//
// Every field is a single-word atomic. The command side writes the target
// volume and mute flag; the audio thread writes the ramped volume and the
// smoothed peak. Nothing here may block: the audio thread reads these on
// every buffer and a stall there is an audible dropout.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::types::TapState;

/// Lowest accepted target volume (silence)
pub const MIN_VOLUME: f32 = 0.0;
/// Highest accepted target volume (2x boost)
pub const MAX_VOLUME: f32 = 2.0;
/// Unity gain
pub const UNITY_VOLUME: f32 = 1.0;

/// f32 stored as its bit pattern in an AtomicU32
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Clamp a requested volume into the accepted range. NaN maps to unity.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        UNITY_VOLUME
    } else {
        volume.clamp(MIN_VOLUME, MAX_VOLUME)
    }
}

#[derive(Debug)]
pub struct GainState {
    target_volume: AtomicF32,
    current_volume: AtomicF32,
    muted: AtomicBool,
    peak_level: AtomicF32,
    callback_count: AtomicU64,
}

impl GainState {
    pub fn new() -> Self {
        Self {
            target_volume: AtomicF32::new(UNITY_VOLUME),
            current_volume: AtomicF32::new(UNITY_VOLUME),
            muted: AtomicBool::new(false),
            peak_level: AtomicF32::new(0.0),
            callback_count: AtomicU64::new(0),
        }
    }

    pub fn target_volume(&self) -> f32 {
        self.target_volume.load()
    }

    /// Returns the value actually stored after clamping
    pub fn set_target_volume(&self, volume: f32) -> f32 {
        let clamped = clamp_volume(volume);
        self.target_volume.store(clamped);
        clamped
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn current_volume(&self) -> f32 {
        self.current_volume.load()
    }

    /// Audio thread only, plus activation before the callback is installed
    pub(crate) fn store_current_volume(&self, volume: f32) {
        self.current_volume.store(volume);
    }

    pub fn peak_level(&self) -> f32 {
        self.peak_level.load()
    }

    /// Audio thread only
    pub(crate) fn store_peak_level(&self, peak: f32) {
        self.peak_level.store(peak);
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_callback(&self) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Skip the ramp: make the audible gain jump straight to the target
    pub(crate) fn snap_to_target(&self) {
        self.current_volume.store(self.target_volume.load());
    }

    pub fn snapshot(&self) -> TapState {
        TapState {
            volume: self.target_volume(),
            muted: self.is_muted(),
        }
    }

    pub fn restore(&self, state: TapState) {
        self.set_target_volume(state.volume);
        self.set_muted(state.muted);
    }
}

impl Default for GainState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_clamped_on_write() {
        let gain = GainState::new();
        assert_eq!(gain.set_target_volume(3.5), MAX_VOLUME);
        assert_eq!(gain.target_volume(), MAX_VOLUME);
        assert_eq!(gain.set_target_volume(-0.2), MIN_VOLUME);
        assert_eq!(gain.set_target_volume(f32::NAN), UNITY_VOLUME);
        assert_eq!(gain.set_target_volume(1.25), 1.25);
    }

    #[test]
    fn test_snapshot_restore() {
        let gain = GainState::new();
        gain.set_target_volume(0.4);
        gain.set_muted(true);

        let other = GainState::new();
        other.restore(gain.snapshot());
        assert_eq!(other.target_volume(), 0.4);
        assert!(other.is_muted());
    }

    #[test]
    fn test_snap_to_target() {
        let gain = GainState::new();
        gain.set_target_volume(1.7);
        assert_eq!(gain.current_volume(), UNITY_VOLUME);
        gain.snap_to_target();
        assert_eq!(gain.current_volume(), 1.7);
    }

    #[test]
    fn test_atomic_f32_bits() {
        let value = AtomicF32::new(-0.125);
        assert_eq!(value.load(), -0.125);
        value.store(0.3);
        assert_eq!(value.load(), 0.3);
    }
}
