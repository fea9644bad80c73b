use crate::sessions::SessionConfig;

/// Configuration options that govern a whole engine
#[derive(Clone)]
pub struct EngineConfig {
    /// Options applied to every session the engine creates
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Creates a new configuration object with default values
    pub fn new() -> EngineConfig {
        EngineConfig {
            session: SessionConfig::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig::new()
    }
}
