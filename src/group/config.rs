use std::time::Duration;

/// Configuration options that govern how a NetGroup media stream should operate.  These are
/// also the parameters announced to peers alongside the stream name and key.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupConfig {
    /// True when this engine produces the fragments instead of pulling them
    pub is_publisher: bool,

    /// Time depth of the fragment window
    pub window_duration: Duration,

    /// Extra retention on top of the window so relayed fragments stay answerable
    pub relay_margin: Duration,

    /// How long a pulled fragment may stay unanswered before asking someone else
    pub fetch_period: Duration,

    /// Cadence of fragments map emission
    pub availability_update_period: Duration,

    /// Broadcast the fragments map to every neighbor instead of one at a time
    pub availability_send_to_all: bool,

    /// A new fragment is pushed to at most `push_limit + 1` neighbors
    pub push_limit: u8,

    /// Suppress the pull congestion timeout (pull requests keep their cadence)
    pub disable_pull_timeout: bool,
}

impl GroupConfig {
    /// Creates a new configuration object with default values
    pub fn new() -> GroupConfig {
        GroupConfig {
            is_publisher: false,
            window_duration: Duration::from_millis(8_000),
            relay_margin: Duration::from_millis(2_000),
            fetch_period: Duration::from_millis(2_500),
            availability_update_period: Duration::from_millis(100),
            availability_send_to_all: false,
            push_limit: 4,
            disable_pull_timeout: false,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> GroupConfig {
        GroupConfig::new()
    }
}
