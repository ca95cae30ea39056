pub mod audio;
pub mod config;
pub mod log;

pub use audio::tap::{
    MemoryStateStore, ProcessId, ProcessTap, TapBackend, TapController, TapError, TapEvent,
    TapState, TapStateStore, TapStats, TapSupervisor,
};
pub use audio::{DefaultDeviceNotifier, DeviceChangeEvent};
pub use config::{SupervisorConfig, TapConfig};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A supervisor on the platform backend, recovering automatically when the
/// default output device changes
pub struct AppVolume {
    supervisor: TapSupervisor,
    notifier: Option<DefaultDeviceNotifier>,
    watcher: Option<JoinHandle<()>>,
}

impl AppVolume {
    /// Start everything. Must be called from within a Tokio runtime.
    pub fn start(config: SupervisorConfig) -> anyhow::Result<Self> {
        Self::start_with(audio::tap::platform_backend(), config, None)
    }

    pub fn start_with(
        backend: Arc<dyn TapBackend>,
        config: SupervisorConfig,
        store: Option<Arc<dyn TapStateStore>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let supervisor = match store {
            Some(store) => TapSupervisor::spawn_with_store(backend, config, store),
            None => TapSupervisor::spawn(backend, config),
        };

        let (notifier, watcher) = match DefaultDeviceNotifier::start() {
            Ok((notifier, events)) => {
                let watcher = supervisor.watch_device_changes(events);
                (Some(notifier), Some(watcher))
            }
            Err(e) => {
                warn!("Device change notifications unavailable: {}", e);
                (None, None)
            }
        };

        info!("App volume control started");
        Ok(Self {
            supervisor,
            notifier,
            watcher,
        })
    }

    pub fn supervisor(&self) -> &TapSupervisor {
        &self.supervisor
    }

    /// Stop listening for device changes, then tear down every tap
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        drop(self.notifier.take());
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.supervisor.shutdown().await?;
        info!("App volume control stopped");
        Ok(())
    }
}
