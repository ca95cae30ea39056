// Real-time signal path run inside the aggregate device's I/O callback
//
// Everything reachable from `TapProcessor::process` runs on the audio
// hardware thread: no allocation, no locks, no logging, no syscalls.
// Control values arrive through `GainState` atomics and the ramped volume
// and peak level leave through them.

use std::sync::Arc;

use super::gain::GainState;
use crate::config::TapConfig;

/// Peak metering looks at one channel of each interleaved stereo buffer
const PEAK_SCAN_STRIDE: usize = 2;

/// Soft-knee limiter: identity up to `threshold`, then a saturating curve
/// approaching 1.0. Sign is preserved.
#[inline]
pub fn soft_limit(sample: f32, threshold: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= threshold {
        return sample;
    }

    let headroom = 1.0 - threshold;
    let overshoot = magnitude - threshold;
    let compressed = threshold + headroom * (overshoot / (overshoot + headroom));
    compressed.copysign(sample)
}

/// Largest absolute sample over every buffer, one channel each, clamped to 1.0
#[inline]
pub fn raw_peak(inputs: &[&[f32]]) -> f32 {
    let mut peak = 0.0f32;
    for buffer in inputs {
        for &sample in buffer.iter().step_by(PEAK_SCAN_STRIDE) {
            let magnitude = sample.abs();
            if magnitude > peak {
                peak = magnitude;
            }
        }
    }
    peak.min(1.0)
}

/// Index of the input buffer feeding output `output_index`. When there are
/// more inputs than outputs the surplus leading inputs are skipped.
#[inline]
pub fn input_index_for_output(
    input_count: usize,
    output_count: usize,
    output_index: usize,
) -> Option<usize> {
    let index = if input_count > output_count {
        input_count - output_count + output_index
    } else {
        output_index
    };
    (index < input_count).then_some(index)
}

/// Per-tap processing state shared with the audio thread
#[derive(Debug)]
pub struct TapProcessor {
    gain: Arc<GainState>,
    ramp_coefficient: f32,
    peak_smoothing: f32,
    limiter_threshold: f32,
}

impl TapProcessor {
    pub fn new(gain: Arc<GainState>, sample_rate: f64, config: &TapConfig) -> Self {
        Self {
            gain,
            ramp_coefficient: config.ramp_coefficient(sample_rate),
            peak_smoothing: config.peak_smoothing,
            limiter_threshold: config.limiter_threshold,
        }
    }

    pub fn ramp_coefficient(&self) -> f32 {
        self.ramp_coefficient
    }

    pub fn gain(&self) -> &Arc<GainState> {
        &self.gain
    }

    /// Process one I/O cycle: meter the input, then write gained audio (or
    /// silence when muted) into every output buffer.
    pub fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        self.gain.record_callback();

        // Metering runs even when muted so the meter shows what is suppressed
        let peak = self.gain.peak_level();
        let raw = raw_peak(inputs);
        self.gain
            .store_peak_level(peak + self.peak_smoothing * (raw - peak));

        if self.gain.is_muted() {
            for output in outputs.iter_mut() {
                output.fill(0.0);
            }
            return;
        }

        let target = self.gain.target_volume();
        let boosted = target > 1.0;
        let coefficient = self.ramp_coefficient;
        let mut current = self.gain.current_volume();

        let output_count = outputs.len();
        for (output_index, output) in outputs.iter_mut().enumerate() {
            let Some(input_index) =
                input_index_for_output(inputs.len(), output_count, output_index)
            else {
                output.fill(0.0);
                continue;
            };

            let input = inputs[input_index];
            let frames = input.len().min(output.len());
            for (out, &sample) in output[..frames].iter_mut().zip(&input[..frames]) {
                current += (target - current) * coefficient;
                let scaled = sample * current;
                *out = if boosted {
                    soft_limit(scaled, self.limiter_threshold)
                } else {
                    scaled
                };
            }
            output[frames..].fill(0.0);
        }

        self.gain.store_current_volume(current);
    }
}
