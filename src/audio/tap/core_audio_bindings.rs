// FFI bindings for macOS Core Audio process taps (14.4+)
//
// Tap creation goes through objc2_core_audio; aggregate devices and property
// access go through coreaudio-sys. Everything here is a thin wrapper that
// turns a non-zero OSStatus into an `Err`.

#![allow(non_upper_case_globals)]

use std::mem;
use std::os::raw::c_void;
use std::ptr;

use core_foundation::base::{CFTypeRef, TCFType};
use core_foundation::string::CFString;
pub use coreaudio_sys::{
    kAudioDevicePropertyDeviceUID, kAudioDevicePropertyStreams,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioObjectPropertyElementMaster,
    kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject, AudioObjectGetPropertyData,
    AudioObjectGetPropertyDataSize, AudioObjectID, AudioObjectPropertyAddress, OSStatus, UInt32,
};
use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_core_audio::{
    AudioHardwareCreateProcessTap, AudioHardwareDestroyProcessTap, CATapDescription,
    CATapMuteBehavior,
};
use objc2_foundation::{NSArray, NSNumber};

pub const kAudioHardwarePropertyTranslatePIDToProcessObject: u32 = 1886352239; // 'pidx'
pub const kAudioTapPropertyUID: u32 = 0x74756964; // 'tuid'
pub const kAudioDevicePropertyNominalSampleRate: u32 = 0x73726174; // 'srat'

const kAudioHardwareNoError: OSStatus = 0;
const kAudioHardwareUnspecifiedError: OSStatus = 2003329396; // 'what'

fn global_address(selector: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMaster,
    }
}

fn check(status: OSStatus) -> Result<(), OSStatus> {
    if status == kAudioHardwareNoError {
        Ok(())
    } else {
        Err(status)
    }
}

/// Describe a stereo mixdown tap of a single process object. The process's
/// own output is muted while the tap is read so it is only heard through
/// the aggregate device.
pub fn create_process_tap_description(process_object: AudioObjectID) -> Retained<CATapDescription> {
    unsafe {
        let alloc = CATapDescription::alloc();
        let process_number = NSNumber::new_u32(process_object);
        let process_array = NSArray::from_slice(&[&*process_number]);

        let description = CATapDescription::initStereoMixdownOfProcesses(alloc, &process_array);
        description.setPrivate(true);
        description.setMuteBehavior(CATapMuteBehavior::MutedWhenTapped);
        description
    }
}

/// Check if AudioHardwareCreateProcessTap is resolvable at runtime
pub fn is_process_tap_available() -> bool {
    use std::ffi::CString;

    let frameworks = [
        "/System/Library/Frameworks/CoreAudio.framework/CoreAudio",
        "/System/Library/Frameworks/AudioToolbox.framework/AudioToolbox",
    ];
    let Ok(symbol) = CString::new("AudioHardwareCreateProcessTap") else {
        return false;
    };

    for framework in frameworks {
        let Ok(path) = CString::new(framework) else {
            continue;
        };

        unsafe {
            let handle = libc::dlopen(path.as_ptr(), libc::RTLD_LAZY);
            if handle.is_null() {
                continue;
            }
            let func = libc::dlsym(handle, symbol.as_ptr());
            libc::dlclose(handle);

            if !func.is_null() {
                tracing::debug!("Found AudioHardwareCreateProcessTap in {}", framework);
                return true;
            }
        }
    }

    tracing::warn!("AudioHardwareCreateProcessTap not found, process taps unavailable");
    false
}

pub unsafe fn create_process_tap(
    description: &Retained<CATapDescription>,
) -> Result<AudioObjectID, OSStatus> {
    let mut tap_id: AudioObjectID = 0;
    check(AudioHardwareCreateProcessTap(
        Some(description.as_ref()),
        &mut tap_id,
    ))?;
    Ok(tap_id)
}

pub unsafe fn destroy_process_tap(tap_id: AudioObjectID) -> Result<(), OSStatus> {
    check(AudioHardwareDestroyProcessTap(tap_id))
}

/// Translate a pid to its Core Audio process object. Yields 0 when the
/// process has never produced audio.
pub unsafe fn translate_pid_to_audio_object(pid: u32) -> Result<AudioObjectID, OSStatus> {
    let address = global_address(kAudioHardwarePropertyTranslatePIDToProcessObject);
    let mut object_id: AudioObjectID = 0;
    let mut data_size = mem::size_of::<AudioObjectID>() as UInt32;

    check(AudioObjectGetPropertyData(
        kAudioObjectSystemObject,
        &address,
        mem::size_of::<u32>() as UInt32,
        &pid as *const u32 as *const c_void,
        &mut data_size,
        &mut object_id as *mut AudioObjectID as *mut c_void,
    ))?;
    Ok(object_id)
}

unsafe fn get_string_property(object: AudioObjectID, selector: u32) -> Result<String, OSStatus> {
    let address = global_address(selector);
    let mut cf_string_ref: CFTypeRef = ptr::null();
    let mut data_size = mem::size_of::<CFTypeRef>() as UInt32;

    check(AudioObjectGetPropertyData(
        object,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut cf_string_ref as *mut CFTypeRef as *mut c_void,
    ))?;

    if cf_string_ref.is_null() {
        return Err(kAudioHardwareUnspecifiedError);
    }

    // The HAL hands back a +1 reference
    let cf_string = CFString::wrap_under_create_rule(cf_string_ref as *const _);
    Ok(cf_string.to_string())
}

pub unsafe fn tap_uid(tap_id: AudioObjectID) -> Result<String, OSStatus> {
    get_string_property(tap_id, kAudioTapPropertyUID)
}

pub unsafe fn device_uid(device_id: AudioObjectID) -> Result<String, OSStatus> {
    get_string_property(device_id, kAudioDevicePropertyDeviceUID)
}

pub unsafe fn default_output_device_id() -> Result<AudioObjectID, OSStatus> {
    let address = global_address(kAudioHardwarePropertyDefaultOutputDevice);
    let mut device_id: AudioObjectID = 0;
    let mut data_size = mem::size_of::<AudioObjectID>() as UInt32;

    check(AudioObjectGetPropertyData(
        kAudioObjectSystemObject,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut device_id as *mut AudioObjectID as *mut c_void,
    ))?;
    Ok(device_id)
}

pub unsafe fn stream_count(device_id: AudioObjectID) -> Result<u32, OSStatus> {
    let address = global_address(kAudioDevicePropertyStreams);
    let mut data_size: UInt32 = 0;

    check(AudioObjectGetPropertyDataSize(
        device_id,
        &address,
        0,
        ptr::null(),
        &mut data_size,
    ))?;
    Ok(data_size / mem::size_of::<AudioObjectID>() as u32)
}

pub unsafe fn nominal_sample_rate(device_id: AudioObjectID) -> Result<f64, OSStatus> {
    let address = global_address(kAudioDevicePropertyNominalSampleRate);
    let mut sample_rate: f64 = 0.0;
    let mut data_size = mem::size_of::<f64>() as UInt32;

    check(AudioObjectGetPropertyData(
        device_id,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut sample_rate as *mut f64 as *mut c_void,
    ))?;
    Ok(sample_rate)
}

/// Create an aggregate device from a CoreFoundation description dictionary
pub unsafe fn create_aggregate_device(description: CFTypeRef) -> Result<AudioObjectID, OSStatus> {
    let mut device_id: AudioObjectID = 0;
    check(coreaudio_sys::AudioHardwareCreateAggregateDevice(
        description as *const _,
        &mut device_id,
    ))?;
    Ok(device_id)
}

pub unsafe fn destroy_aggregate_device(device_id: AudioObjectID) -> Result<(), OSStatus> {
    check(coreaudio_sys::AudioHardwareDestroyAggregateDevice(device_id))
}
