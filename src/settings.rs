use crate::Settings;

/// Current target settings. `version` increases on every effective change.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    current: Settings,
    version: u64,
}

impl SettingsStore {
    pub fn new(initial: Settings) -> Self {
        Self {
            current: initial,
            version: 0,
        }
    }

    pub fn current(&self) -> Settings {
        self.current
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns `false` when `next` equals the current value; nothing changes then.
    pub fn update(&mut self, next: Settings) -> bool {
        if next == self.current {
            return false;
        }
        self.current = next;
        self.version += 1;
        true
    }
}
