//! Endpoint configuration.

use mux_wire::{ConnectionLimits, DEFAULT_MAX_LENGTH};
use std::time::Duration;

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Dialogs the peer may have open on this endpoint at once
    pub max_dialogs: u32,
    /// Largest frame payload accepted
    pub max_length: u32,
    /// Largest dialog message accepted
    pub max_total_length: u32,
    /// Heartbeat interval proposed during the handshake
    pub heartbeat_interval: Duration,
    /// Silent heartbeat intervals tolerated before the connection times out
    pub heartbeat_timeout: u32,
    /// Whether this side sends heartbeats
    pub send_heartbeat: bool,
    /// Terminate after this long without any dialog
    pub idle_timeout: Option<Duration>,
    /// Deadline for reaching NORMAL
    pub connect_timeout: Duration,
    /// Dialogs drained per flush pass
    pub flush_batch_num_contexts: usize,
    /// Flush passes per scheduled flush
    pub flush_num_batches: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_dialogs: 1024,
            max_length: DEFAULT_MAX_LENGTH,
            max_total_length: 16 * 1024 * 1024, // 16 MiB
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: 5,
            send_heartbeat: true,
            idle_timeout: None,
            connect_timeout: Duration::from_secs(30),
            flush_batch_num_contexts: 64,
            flush_num_batches: 4,
        }
    }
}

impl EndpointConfig {
    /// Limits advertised in CONNECTION_CONFIG
    pub fn local_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_dialogs: self.max_dialogs,
            max_length: self.max_length,
            max_total_length: self.max_total_length,
            heartbeat_interval: u32::try_from(self.heartbeat_interval.as_millis())
                .unwrap_or(u32::MAX)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_limits() {
        let config = EndpointConfig {
            max_dialogs: 7,
            heartbeat_interval: Duration::from_millis(250),
            ..Default::default()
        };
        let limits = config.local_limits();
        assert_eq!(limits.max_dialogs, 7);
        assert_eq!(limits.max_length, DEFAULT_MAX_LENGTH);
        assert_eq!(limits.heartbeat_interval, 250);
    }

    #[test]
    fn test_heartbeat_interval_saturates() {
        let config = EndpointConfig {
            heartbeat_interval: Duration::from_secs(u64::MAX / 1000),
            ..Default::default()
        };
        assert_eq!(config.local_limits().heartbeat_interval, u32::MAX);
    }
}
