use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of a [`crate::World`] and its scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Entity slots reserved up front.
    pub initial_entity_capacity: usize,
    /// A system running longer than this in one frame is logged as slow.
    /// Zero disables the check.
    pub slow_system_threshold_ms: u64,
    /// Catch panics raised by systems and report them as faults. When false
    /// the panic is logged and then resumed.
    pub isolate_panics: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            initial_entity_capacity: 1024,
            slow_system_threshold_ms: 16,
            isolate_panics: true,
        }
    }
}

impl WorldConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn slow_system_threshold(&self) -> Option<Duration> {
        (self.slow_system_threshold_ms > 0).then(|| Duration::from_millis(self.slow_system_threshold_ms))
    }
}
