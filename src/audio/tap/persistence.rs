// Interface to the persistence collaborator
//
// Volume and mute survive relaunches keyed by a stable application
// identifier (a bundle id, say), never by pid. The supervisor loads through
// this trait when it first creates a tap for a bound process and saves on
// every successful volume or mute change.

use std::collections::HashMap;
use std::sync::Mutex;

use super::types::TapState;

pub trait TapStateStore: Send + Sync {
    fn load(&self, key: &str) -> Option<TapState>;
    fn save(&self, key: &str, state: TapState);
}

/// Process-lifetime store, for hosts that persist elsewhere and for tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, TapState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(key: impl Into<String>, state: TapState) -> Self {
        let store = Self::new();
        store.save(&key.into(), state);
        store
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|states| states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TapStateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Option<TapState> {
        self.states.lock().ok()?.get(key).copied()
    }

    fn save(&self, key: &str, state: TapState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(key.to_string(), state);
        }
    }
}
