//! Manager-level configuration
//!
//! Mirrors [`crate::error`]'s relationship to `synctv-cluster::error`: a plain,
//! environment-agnostic struct with sane defaults. Parsing these fields out of
//! environment variables or a config file is the hosting binary's job.

use std::time::Duration;

/// Configuration for a [`crate::manager::RoomManager`]
#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
    /// Redis connection URL used for both the command and subscribe connections
    pub redis_url: String,
    /// Key prefix shared by every room's hash/list/channel keys
    pub prefix: String,
    /// How long a consumer room may sit idle (initialized, zero callbacks) before being reaped
    pub idle_timeout: Duration,
    /// How often the idle reaper scans the room map
    pub check_interval: Duration,
    /// Capacity of the bounded channel used to fan out messages from the shared
    /// Redis subscribe connection to each room's local handler. Protects against
    /// unbounded memory growth if a room's merge/dispatch falls behind.
    pub subscriber_channel_capacity: usize,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: "room".to_string(),
            idle_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
            subscriber_channel_capacity: 256,
        }
    }
}
