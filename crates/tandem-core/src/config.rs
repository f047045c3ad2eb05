//! Centralized configuration for the tandem runtime.
//!
//! This module provides the protocol constants and the defaults used by the
//! client, pool and server when the caller does not override them.

use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const VERSION: &'static str = "2.0";
    /// Largest single JSON value the decoder will buffer.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const READ_CHUNK_SIZE: usize = 8192;
}

/// Client-side defaults.
pub struct ClientConfig;

impl ClientConfig {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(20);
    pub const DEFAULT_POOL_SIZE: usize = 4;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Server-side defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const MAX_CONNECTIONS: usize = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ClientConfig::DEFAULT_CALL_TIMEOUT > ClientConfig::CONNECT_TIMEOUT);
        assert!(ClientConfig::CONNECT_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_sizes_are_consistent() {
        assert!(ProtocolConfig::READ_CHUNK_SIZE < ProtocolConfig::MAX_MESSAGE_SIZE);
        assert!(ClientConfig::DEFAULT_POOL_SIZE > 0);
    }
}
