// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for node transport and call deadlines.

use std::path::PathBuf;
use std::time::Duration;

use hangar_protocol::{NodeClientConfig, TlsMaterial};

use crate::error::{AgentError, Result};

/// Per-call deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Ping, stats, start, stop, restart, delete, command and logs.
    pub control: Duration,
    /// Workload creation; image pulls and installs can take minutes.
    pub provision: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(10),
            provision: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Client certificate presented to daemons (PEM).
    pub cert_path: Option<PathBuf>,
    /// Private key for `cert_path` (PEM).
    pub key_path: Option<PathBuf>,
    /// CA that issued the daemon certificates (PEM).
    pub ca_path: Option<PathBuf>,
    /// Skip TLS verification and client auth (development only).
    pub insecure_transport: bool,
    /// Bound on establishing a connection.
    pub dial_timeout: Duration,
    pub timeouts: CallTimeouts,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            ca_path: None,
            insecure_transport: false,
            dial_timeout: Duration::from_secs(5),
            timeouts: CallTimeouts::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for local development against self-signed daemons.
    pub fn insecure() -> Self {
        Self {
            insecure_transport: true,
            ..Self::default()
        }
    }

    pub fn with_tls(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
        ca: impl Into<PathBuf>,
    ) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self.ca_path = Some(ca.into());
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Resolve into a QUIC client configuration, loading PEM files from disk.
    pub fn client_config(&self) -> Result<NodeClientConfig> {
        if self.insecure_transport {
            return Ok(NodeClientConfig::insecure());
        }

        let (Some(cert), Some(key), Some(ca)) = (&self.cert_path, &self.key_path, &self.ca_path)
        else {
            return Err(AgentError::Config(
                "mutual TLS requires certificate, key and CA paths".to_string(),
            ));
        };

        let material =
            TlsMaterial::from_files(cert, key, ca).map_err(|e| AgentError::Config(e.to_string()))?;
        Ok(NodeClientConfig::mutual_tls(material))
    }
}
