// Audio devices module - system device change monitoring
pub mod notifications;

pub use notifications::{DefaultDeviceNotifier, DeviceChangeEvent};
