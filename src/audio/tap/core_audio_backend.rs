// Core Audio implementation of `TapBackend`
//
// Owns the IOProc registry: each registered callback keeps one strong
// reference to its `TapProcessor` as client data, released only after the
// OS confirms the IOProc is destroyed.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use colored::Colorize;
use core_foundation::array::CFArray;
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use coreaudio_sys::{
    AudioBuffer, AudioBufferList, AudioDeviceCreateIOProcID, AudioDeviceDestroyIOProcID,
    AudioDeviceIOProcID, AudioDeviceStart, AudioDeviceStop, AudioObjectID, AudioTimeStamp,
    OSStatus,
};
use tracing::{debug, error, info};

use super::backend::TapBackend;
use super::core_audio_bindings as bindings;
use super::processing::TapProcessor;
use super::types::{
    AggregateDeviceSpec, AudioObjectId, IoProcHandle, OsStatusError, OutputDevice, ProcessId,
};

/// Upper bound on buffers handed to the processor per callback
const MAX_BUFFERS: usize = 16;

const BAD_OBJECT_ERROR: OSStatus = 560947818; // kAudioHardwareBadObjectError

struct RegisteredIoProc {
    proc_id: AudioDeviceIOProcID,
    processor: *const TapProcessor,
}

// The raw processor pointer is an `Arc` we own; it is only dereferenced by
// the IOProc and only released once that IOProc is gone.
unsafe impl Send for RegisteredIoProc {}

pub struct CoreAudioBackend {
    supported: bool,
    next_io_proc: AtomicU64,
    io_procs: Mutex<HashMap<u64, RegisteredIoProc>>,
}

impl CoreAudioBackend {
    pub fn new() -> Self {
        let supported = bindings::is_process_tap_available();
        info!(
            "{} Core Audio process taps {}",
            "TAP_BACKEND".bright_cyan(),
            if supported { "available" } else { "unavailable" }
        );

        Self {
            supported,
            next_io_proc: AtomicU64::new(1),
            io_procs: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, RegisteredIoProc>> {
        self.io_procs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registered_proc(
        &self,
        io_proc: IoProcHandle,
        operation: &'static str,
    ) -> Result<AudioDeviceIOProcID, OsStatusError> {
        self.registry()
            .get(&io_proc.0)
            .map(|registered| registered.proc_id)
            .ok_or_else(|| OsStatusError::new(operation, BAD_OBJECT_ERROR))
    }
}

impl Default for CoreAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        // Entries left here were never destroyed; their processors are leaked
        let leftover = self.registry().len();
        if leftover > 0 {
            error!("{} IOProc(s) still registered at backend drop", leftover);
        }
    }
}

/// Build the CoreFoundation description of a private aggregate device that
/// stacks the output device with the tap
fn aggregate_description(
    spec: &AggregateDeviceSpec,
    tap_uid: &str,
) -> CFDictionary<CFString, CFType> {
    let drift = CFNumber::from(i32::from(spec.drift_compensation));

    let sub_device = CFDictionary::from_CFType_pairs(&[
        (CFString::new("uid"), CFString::new(&spec.output.uid).as_CFType()),
        (CFString::new("drift"), drift.as_CFType()),
    ]);
    let sub_tap = CFDictionary::from_CFType_pairs(&[
        (CFString::new("uid"), CFString::new(tap_uid).as_CFType()),
        (CFString::new("drift"), drift.as_CFType()),
    ]);

    CFDictionary::from_CFType_pairs(&[
        (CFString::new("name"), CFString::new(&spec.name).as_CFType()),
        (CFString::new("uid"), CFString::new(&spec.uid).as_CFType()),
        (
            CFString::new("master"),
            CFString::new(&spec.output.uid).as_CFType(),
        ),
        (
            CFString::new("private"),
            CFNumber::from(i32::from(spec.private)).as_CFType(),
        ),
        (CFString::new("stacked"), CFNumber::from(0i32).as_CFType()),
        (
            CFString::new("tapautostart"),
            CFNumber::from(i32::from(spec.tap_auto_start)).as_CFType(),
        ),
        (
            CFString::new("subdevices"),
            CFArray::from_CFTypes(&[sub_device]).as_CFType(),
        ),
        (
            CFString::new("taps"),
            CFArray::from_CFTypes(&[sub_tap]).as_CFType(),
        ),
    ])
}

impl TapBackend for CoreAudioBackend {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn resolve_process(&self, pid: ProcessId) -> Option<AudioObjectId> {
        match unsafe { bindings::translate_pid_to_audio_object(pid) } {
            Ok(0) => None,
            Ok(object) => Some(AudioObjectId(object)),
            Err(status) => {
                debug!("Translating PID {} failed: OSStatus {}", pid, status);
                None
            }
        }
    }

    fn create_process_tap(&self, process: AudioObjectId) -> Result<AudioObjectId, OsStatusError> {
        let description = bindings::create_process_tap_description(process.0);
        unsafe { bindings::create_process_tap(&description) }
            .map(AudioObjectId)
            .map_err(|status| OsStatusError::new("AudioHardwareCreateProcessTap", status))
    }

    fn destroy_process_tap(&self, tap: AudioObjectId) -> Result<(), OsStatusError> {
        unsafe { bindings::destroy_process_tap(tap.0) }
            .map_err(|status| OsStatusError::new("AudioHardwareDestroyProcessTap", status))
    }

    fn default_output_device(&self) -> Option<OutputDevice> {
        let id = unsafe { bindings::default_output_device_id() }
            .ok()
            .filter(|id| *id != 0)?;
        let uid = unsafe { bindings::device_uid(id) }.ok()?;
        Some(OutputDevice {
            id: AudioObjectId(id),
            uid,
        })
    }

    fn create_aggregate_device(
        &self,
        spec: &AggregateDeviceSpec,
    ) -> Result<AudioObjectId, OsStatusError> {
        let tap_uid = unsafe { bindings::tap_uid(spec.tap.0) }
            .map_err(|status| OsStatusError::new("kAudioTapPropertyUID", status))?;
        let description = aggregate_description(spec, &tap_uid);

        debug!(
            "Creating aggregate '{}' ({}) over output '{}' with tap {}",
            spec.name, spec.uid, spec.output.uid, tap_uid
        );

        unsafe { bindings::create_aggregate_device(description.as_CFTypeRef()) }
            .map(AudioObjectId)
            .map_err(|status| OsStatusError::new("AudioHardwareCreateAggregateDevice", status))
    }

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> Result<(), OsStatusError> {
        unsafe { bindings::destroy_aggregate_device(device.0) }
            .map_err(|status| OsStatusError::new("AudioHardwareDestroyAggregateDevice", status))
    }

    fn active_stream_count(&self, device: AudioObjectId) -> Result<u32, OsStatusError> {
        unsafe { bindings::stream_count(device.0) }
            .map_err(|status| OsStatusError::new("kAudioDevicePropertyStreams", status))
    }

    fn nominal_sample_rate(&self, device: AudioObjectId) -> Option<f64> {
        unsafe { bindings::nominal_sample_rate(device.0) }
            .ok()
            .filter(|rate| *rate > 0.0)
    }

    fn create_io_proc(
        &self,
        device: AudioObjectId,
        processor: Arc<TapProcessor>,
    ) -> Result<IoProcHandle, OsStatusError> {
        let client_data = Arc::into_raw(processor);
        let mut proc_id: AudioDeviceIOProcID = None;

        let status = unsafe {
            AudioDeviceCreateIOProcID(
                device.0,
                Some(tap_io_proc),
                client_data as *mut c_void,
                &mut proc_id,
            )
        };

        if status != 0 || proc_id.is_none() {
            unsafe { drop(Arc::from_raw(client_data)) };
            return Err(OsStatusError::new("AudioDeviceCreateIOProcID", status));
        }

        let handle = IoProcHandle(self.next_io_proc.fetch_add(1, Ordering::Relaxed));
        self.registry().insert(
            handle.0,
            RegisteredIoProc {
                proc_id,
                processor: client_data,
            },
        );
        Ok(handle)
    }

    fn start_device(
        &self,
        device: AudioObjectId,
        io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        let proc_id = self.registered_proc(io_proc, "AudioDeviceStart")?;
        match unsafe { AudioDeviceStart(device.0, proc_id) } {
            0 => Ok(()),
            status => Err(OsStatusError::new("AudioDeviceStart", status)),
        }
    }

    fn stop_device(&self, device: AudioObjectId, io_proc: IoProcHandle) -> Result<(), OsStatusError> {
        let proc_id = self.registered_proc(io_proc, "AudioDeviceStop")?;
        match unsafe { AudioDeviceStop(device.0, proc_id) } {
            0 => Ok(()),
            status => Err(OsStatusError::new("AudioDeviceStop", status)),
        }
    }

    fn destroy_io_proc(
        &self,
        device: AudioObjectId,
        io_proc: IoProcHandle,
    ) -> Result<(), OsStatusError> {
        let Some(registered) = self.registry().remove(&io_proc.0) else {
            return Err(OsStatusError::new(
                "AudioDeviceDestroyIOProcID",
                BAD_OBJECT_ERROR,
            ));
        };

        let status = unsafe { AudioDeviceDestroyIOProcID(device.0, registered.proc_id) };
        if status != 0 {
            // The callback may still fire, so its processor stays alive
            error!(
                "AudioDeviceDestroyIOProcID failed on device {}, leaking processor",
                device
            );
            return Err(OsStatusError::new("AudioDeviceDestroyIOProcID", status));
        }

        unsafe { drop(Arc::from_raw(registered.processor)) };
        Ok(())
    }
}

unsafe fn buffers<'a>(list: *const AudioBufferList) -> &'a [AudioBuffer] {
    if list.is_null() {
        return &[];
    }
    let list = &*list;
    // mBuffers is declared with length 1 but is really mNumberBuffers long
    std::slice::from_raw_parts(list.mBuffers.as_ptr(), list.mNumberBuffers as usize)
}

unsafe fn samples<'a>(buffer: &AudioBuffer) -> &'a [f32] {
    if buffer.mData.is_null() {
        return &[];
    }
    let len = buffer.mDataByteSize as usize / std::mem::size_of::<f32>();
    std::slice::from_raw_parts(buffer.mData as *const f32, len)
}

unsafe fn samples_mut<'a>(buffer: &AudioBuffer) -> &'a mut [f32] {
    if buffer.mData.is_null() {
        return &mut [];
    }
    let len = buffer.mDataByteSize as usize / std::mem::size_of::<f32>();
    std::slice::from_raw_parts_mut(buffer.mData as *mut f32, len)
}

/// Real-time IOProc: no allocation, no locks, no logging
unsafe extern "C" fn tap_io_proc(
    _device: AudioObjectID,
    _now: *const AudioTimeStamp,
    input_data: *const AudioBufferList,
    _input_time: *const AudioTimeStamp,
    output_data: *mut AudioBufferList,
    _output_time: *const AudioTimeStamp,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() {
        return 0;
    }
    let processor = &*(client_data as *const TapProcessor);

    // Taps come last in the aggregate's input list, so keep the trailing buffers
    let input_buffers = buffers(input_data);
    let skipped = input_buffers.len().saturating_sub(MAX_BUFFERS);
    let mut inputs: [&[f32]; MAX_BUFFERS] = [&[]; MAX_BUFFERS];
    let mut input_count = 0;
    for buffer in &input_buffers[skipped..] {
        inputs[input_count] = samples(buffer);
        input_count += 1;
    }

    let output_buffers = buffers(output_data);
    let mut outputs: [&mut [f32]; MAX_BUFFERS] = Default::default();
    let mut output_count = 0;
    for buffer in output_buffers {
        let out = samples_mut(buffer);
        if output_count < MAX_BUFFERS {
            outputs[output_count] = out;
            output_count += 1;
        } else {
            out.fill(0.0);
        }
    }

    processor.process(&inputs[..input_count], &mut outputs[..output_count]);
    0
}
