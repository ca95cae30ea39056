// Default output device change notifications
//
// Registers a Core Audio property listener for the system default output
// device and turns its notifications into `DeviceChangeEvent`s on an
// unbounded channel. The listener fires on a HAL notification thread, never
// on an audio thread.

#[cfg(not(target_os = "macos"))]
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChangeEvent {
    DefaultOutputChanged {
        old_device_id: Option<u32>,
        new_device_id: u32,
    },
}

/// Record `current` as the latest default output device and describe the
/// change, if there was one
pub fn detect_default_change(last: &mut Option<u32>, current: u32) -> Option<DeviceChangeEvent> {
    let old_device_id = last.replace(current);
    if old_device_id == Some(current) {
        return None;
    }

    Some(DeviceChangeEvent::DefaultOutputChanged {
        old_device_id,
        new_device_id: current,
    })
}

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::c_void;
    use std::mem;
    use std::ptr;
    use std::sync::Mutex;

    use anyhow::Result;
    use coreaudio_sys::{
        kAudioHardwarePropertyDefaultOutputDevice, kAudioObjectPropertyElementMaster,
        kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject, AudioDeviceID,
        AudioObjectAddPropertyListener, AudioObjectGetPropertyData, AudioObjectID,
        AudioObjectPropertyAddress, AudioObjectRemovePropertyListener, OSStatus,
    };
    use tokio::sync::mpsc;
    use tracing::{debug, info};

    use super::{detect_default_change, DeviceChangeEvent};

    const DEFAULT_OUTPUT_ADDRESS: AudioObjectPropertyAddress = AudioObjectPropertyAddress {
        mSelector: kAudioHardwarePropertyDefaultOutputDevice,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMaster,
    };

    struct ListenerContext {
        sender: mpsc::UnboundedSender<DeviceChangeEvent>,
        last_output: Mutex<Option<AudioDeviceID>>,
    }

    fn default_output_device() -> Option<AudioDeviceID> {
        let mut device_id: AudioDeviceID = 0;
        let mut size = mem::size_of::<AudioDeviceID>() as u32;

        let status = unsafe {
            AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &DEFAULT_OUTPUT_ADDRESS,
                0,
                ptr::null(),
                &mut size,
                &mut device_id as *mut AudioDeviceID as *mut c_void,
            )
        };

        (status == 0 && device_id != 0).then_some(device_id)
    }

    /// Listens for default output device changes until dropped
    pub struct DefaultDeviceNotifier {
        context: Box<ListenerContext>,
    }

    impl DefaultDeviceNotifier {
        pub fn start() -> Result<(Self, mpsc::UnboundedReceiver<DeviceChangeEvent>)> {
            let (sender, receiver) = mpsc::unbounded_channel();
            let notifier = Self {
                context: Box::new(ListenerContext {
                    sender,
                    last_output: Mutex::new(default_output_device()),
                }),
            };

            let status = unsafe {
                AudioObjectAddPropertyListener(
                    kAudioObjectSystemObject,
                    &DEFAULT_OUTPUT_ADDRESS,
                    Some(default_output_listener),
                    notifier.client_data(),
                )
            };
            if status != 0 {
                return Err(anyhow::anyhow!(
                    "Failed to register default output device listener: {}",
                    status
                ));
            }

            info!("🔄 Listening for default output device changes");
            Ok((notifier, receiver))
        }

        fn client_data(&self) -> *mut c_void {
            &*self.context as *const ListenerContext as *mut c_void
        }
    }

    impl Drop for DefaultDeviceNotifier {
        fn drop(&mut self) {
            let _status = unsafe {
                AudioObjectRemovePropertyListener(
                    kAudioObjectSystemObject,
                    &DEFAULT_OUTPUT_ADDRESS,
                    Some(default_output_listener),
                    self.client_data(),
                )
            };
            debug!("Default output device listener removed");
        }
    }

    unsafe extern "C" fn default_output_listener(
        _in_object_id: AudioObjectID,
        in_number_addresses: u32,
        in_addresses: *const AudioObjectPropertyAddress,
        in_client_data: *mut c_void,
    ) -> OSStatus {
        if in_client_data.is_null() || in_addresses.is_null() {
            return 0;
        }

        let context = &*(in_client_data as *const ListenerContext);
        let addresses = std::slice::from_raw_parts(in_addresses, in_number_addresses as usize);
        if !addresses
            .iter()
            .any(|address| address.mSelector == kAudioHardwarePropertyDefaultOutputDevice)
        {
            return 0;
        }

        let Some(current) = default_output_device() else {
            return 0;
        };
        let event = match context.last_output.lock() {
            Ok(mut last) => detect_default_change(&mut last, current),
            Err(_) => return 0,
        };

        if let Some(event) = event {
            let _ = context.sender.send(event);
        }
        0
    }
}

#[cfg(target_os = "macos")]
pub use platform::DefaultDeviceNotifier;

#[cfg(not(target_os = "macos"))]
pub struct DefaultDeviceNotifier;

#[cfg(not(target_os = "macos"))]
impl DefaultDeviceNotifier {
    pub fn start() -> anyhow::Result<(Self, mpsc::UnboundedReceiver<DeviceChangeEvent>)> {
        Err(anyhow::anyhow!("CoreAudio not available on this platform"))
    }
}
