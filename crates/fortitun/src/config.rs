// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel and TLS configuration.
//!
//! [`TunnelConfig`] covers the per-session options of the control surface;
//! [`TlsSettings`] covers certificate policy for the carrier connection.
//!
//! # Example
//!
//! ```
//! use fortitun::config::TunnelConfig;
//!
//! let config = TunnelConfig {
//!     tcp_nodelay: true,
//!     max_clients: 4,
//!     ..Default::default()
//! };
//! assert_eq!(config.clamped_max_clients(), 4);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on concurrent forwarders per tunnel.
pub const MAX_CLIENTS_LIMIT: u16 = 32;

/// Per-tunnel options.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Disable Nagle's algorithm on both the external socket and the
    /// in-tunnel connection.
    pub tcp_nodelay: bool,

    /// Maximum number of concurrently connected forwarders (1..=32).
    pub max_clients: u16,

    /// TCP keep-alive interval for external sockets; 0 disables.
    pub keep_alive_ms: u32,

    /// Per-forwarder connect timeout inside the tunnel.
    pub connect_timeout_ms: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: false,
            max_clients: 1,
            keep_alive_ms: 0,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TunnelConfig {
    /// `max_clients` clamped into `1..=MAX_CLIENTS_LIMIT`.
    pub fn clamped_max_clients(&self) -> usize {
        usize::from(self.max_clients.clamp(1, MAX_CLIENTS_LIMIT))
    }

    /// Forwarder connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.connect_timeout_ms))
    }

    /// External-socket keep-alive, `None` when disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        if self.keep_alive_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(u64::from(self.keep_alive_ms)))
        }
    }
}

/// Certificate policy for the carrier TLS connection.
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Extra trust anchors (PEM bundle) consulted before the bundled roots.
    pub ca_file: Option<PathBuf>,

    /// Enforce that the certificate matches the firewall host name.
    /// Disabling only downgrades the name check; chain validation stays.
    pub check_hostname: bool,
}

impl TlsSettings {
    /// Policy with host-name binding enabled and no extra CA file.
    pub fn strict() -> Self {
        Self {
            ca_file: None,
            check_hostname: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.clamped_max_clients(), 1);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.keep_alive().is_none());
    }

    #[test]
    fn test_max_clients_clamped() {
        let mut config = TunnelConfig {
            max_clients: 0,
            ..Default::default()
        };
        assert_eq!(config.clamped_max_clients(), 1);

        config.max_clients = 1000;
        assert_eq!(config.clamped_max_clients(), 32);
    }

    #[test]
    fn test_keep_alive_enabled() {
        let config = TunnelConfig {
            keep_alive_ms: 15_000,
            ..Default::default()
        };
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(15)));
    }
}
