use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Global flag to control verbose tap diagnostics
pub static AUDIO_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "app_volume_lib=info";

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// Set verbose tap diagnostics on/off
pub fn set_audio_debug(enabled: bool) {
    AUDIO_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "🔧 Audio debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if verbose tap diagnostics are enabled
pub fn is_audio_debug_enabled() -> bool {
    AUDIO_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Tap diagnostics: logged at info when audio debug is on, at debug otherwise.
/// Never use from the real-time callback.
#[macro_export]
macro_rules! audio_debug {
    ($($arg:tt)*) => {
        if $crate::log::AUDIO_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            ::tracing::info!($($arg)*);
        } else {
            ::tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_audio_debug_toggle() {
        set_audio_debug(true);
        assert!(is_audio_debug_enabled());
        set_audio_debug(false);
        assert!(!is_audio_debug_enabled());
    }
}
