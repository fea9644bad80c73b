use std::time::Duration;

/// Configuration options that govern how an RTMFP session should operate
#[derive(Clone)]
pub struct SessionConfig {
    /// Silence tolerated before a keep-alive probe is sent
    pub keepalive: Duration,

    /// Silence tolerated before the session is declared dead and freed
    pub close_timeout: Duration,
}

impl SessionConfig {
    /// Creates a new configuration object with default values
    pub fn new() -> SessionConfig {
        SessionConfig {
            keepalive: Duration::from_millis(30_000),
            close_timeout: Duration::from_millis(95_000),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig::new()
    }
}
