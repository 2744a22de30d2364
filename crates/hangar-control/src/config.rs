// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use hangar_agent_sdk::{AgentConfig, CallTimeouts};

use crate::allocation::PortRange;

/// Hangar control-plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Client certificate presented to node daemons
    pub tls_cert: Option<PathBuf>,
    /// Private key for `tls_cert`
    pub tls_key: Option<PathBuf>,
    /// CA that issued the daemon certificates
    pub tls_ca: Option<PathBuf>,
    /// Skip TLS verification and client auth (development only)
    pub insecure_transport: bool,
    /// Candidate ports for new allocations
    pub port_range: PortRange,
    pub dial_timeout: Duration,
    /// Deadline for control RPCs (start, stop, logs, ...)
    pub rpc_timeout: Duration,
    /// Deadline for the provisioning RPC
    pub provision_timeout: Duration,
    /// Grace period passed to the daemon on stop
    pub stop_grace: Duration,
    /// Currency granted when a user is created
    pub starting_balance: i64,
    /// Root under which each workload gets `<root>/<workload_id>`
    pub data_root: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `HANGAR_DATABASE_URL`: PostgreSQL or SQLite connection string
    /// - `HANGAR_TLS_CERT`, `HANGAR_TLS_KEY`, `HANGAR_TLS_CA`: unless insecure
    ///
    /// Optional (with defaults):
    /// - `HANGAR_INSECURE_TRANSPORT`: development-only transport (default: false)
    /// - `HANGAR_PORT_RANGE`: allocation range (default: 25565-25600)
    /// - `HANGAR_DIAL_TIMEOUT_MS`: dial bound (default: 5000)
    /// - `HANGAR_RPC_TIMEOUT_MS`: control RPC deadline (default: 10000)
    /// - `HANGAR_PROVISION_TIMEOUT_SECS`: provisioning deadline (default: 600)
    /// - `HANGAR_STOP_GRACE_SECS`: stop grace period (default: 30)
    /// - `HANGAR_STARTING_BALANCE`: starting grant for new users (default: 0)
    /// - `HANGAR_DATA_ROOT`: workload data root (default: /srv/hangar/volumes)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HANGAR_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("HANGAR_DATABASE_URL"))?;

        let insecure_transport = std::env::var("HANGAR_INSECURE_TRANSPORT")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        let tls_cert = std::env::var("HANGAR_TLS_CERT").ok().map(PathBuf::from);
        let tls_key = std::env::var("HANGAR_TLS_KEY").ok().map(PathBuf::from);
        let tls_ca = std::env::var("HANGAR_TLS_CA").ok().map(PathBuf::from);
        if !insecure_transport {
            tls_cert
                .as_ref()
                .ok_or(ConfigError::Missing("HANGAR_TLS_CERT"))?;
            tls_key.as_ref().ok_or(ConfigError::Missing("HANGAR_TLS_KEY"))?;
            tls_ca.as_ref().ok_or(ConfigError::Missing("HANGAR_TLS_CA"))?;
        }

        let port_range: PortRange = std::env::var("HANGAR_PORT_RANGE")
            .unwrap_or_else(|_| "25565-25600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("HANGAR_PORT_RANGE", "must be START-END with START <= END")
            })?;

        let dial_timeout_ms = parse_u64("HANGAR_DIAL_TIMEOUT_MS", 5_000)?;
        let rpc_timeout_ms = parse_u64("HANGAR_RPC_TIMEOUT_MS", 10_000)?;
        let provision_timeout_secs = parse_u64("HANGAR_PROVISION_TIMEOUT_SECS", 600)?;
        let stop_grace_secs = parse_u64("HANGAR_STOP_GRACE_SECS", 30)?;

        let starting_balance: i64 = std::env::var("HANGAR_STARTING_BALANCE")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .ok()
            .filter(|v| *v >= 0)
            .ok_or(ConfigError::Invalid(
                "HANGAR_STARTING_BALANCE",
                "must be a non-negative integer",
            ))?;

        let data_root =
            std::env::var("HANGAR_DATA_ROOT").unwrap_or_else(|_| "/srv/hangar/volumes".to_string());

        Ok(Self {
            database_url,
            tls_cert,
            tls_key,
            tls_ca,
            insecure_transport,
            port_range,
            dial_timeout: Duration::from_millis(dial_timeout_ms),
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            provision_timeout: Duration::from_secs(provision_timeout_secs),
            stop_grace: Duration::from_secs(stop_grace_secs),
            starting_balance,
            data_root,
        })
    }

    /// Node transport settings derived from this configuration.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            cert_path: self.tls_cert.clone(),
            key_path: self.tls_key.clone(),
            ca_path: self.tls_ca.clone(),
            insecure_transport: self.insecure_transport,
            dial_timeout: self.dial_timeout,
            timeouts: self.call_timeouts(),
        }
    }

    pub fn call_timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            control: self.rpc_timeout,
            provision: self.provision_timeout,
        }
    }
}

fn parse_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 12] = [
        "HANGAR_DATABASE_URL",
        "HANGAR_TLS_CERT",
        "HANGAR_TLS_KEY",
        "HANGAR_TLS_CA",
        "HANGAR_INSECURE_TRANSPORT",
        "HANGAR_PORT_RANGE",
        "HANGAR_DIAL_TIMEOUT_MS",
        "HANGAR_RPC_TIMEOUT_MS",
        "HANGAR_PROVISION_TIMEOUT_SECS",
        "HANGAR_STOP_GRACE_SECS",
        "HANGAR_STARTING_BALANCE",
        "HANGAR_DATA_ROOT",
    ];

    /// Sets env vars for a test and restores them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate for every hangar variable.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in KEYS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults_in_insecure_mode() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_DATABASE_URL", "sqlite::memory:");
        guard.set("HANGAR_INSECURE_TRANSPORT", "true");

        let config = Config::from_env().unwrap();

        assert!(config.insecure_transport);
        assert_eq!(config.port_range, PortRange::new(25565, 25600).unwrap());
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.provision_timeout, Duration::from_secs(600));
        assert_eq!(config.stop_grace, Duration::from_secs(30));
        assert_eq!(config.starting_balance, 0);
        assert_eq!(config.data_root, "/srv/hangar/volumes");
        assert!(config.agent_config().insecure_transport);
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HANGAR_DATABASE_URL")));
    }

    #[test]
    fn test_secure_mode_requires_tls_paths() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_DATABASE_URL", "postgres://localhost/hangar");
        guard.set("HANGAR_TLS_CERT", "/etc/hangar/client.pem");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HANGAR_TLS_KEY")));
    }

    #[test]
    fn test_secure_mode_with_tls_paths() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_DATABASE_URL", "postgres://localhost/hangar");
        guard.set("HANGAR_TLS_CERT", "/etc/hangar/client.pem");
        guard.set("HANGAR_TLS_KEY", "/etc/hangar/client.key");
        guard.set("HANGAR_TLS_CA", "/etc/hangar/ca.pem");
        guard.set("HANGAR_RPC_TIMEOUT_MS", "2500");

        let config = Config::from_env().unwrap();
        let agent = config.agent_config();
        assert!(!agent.insecure_transport);
        assert_eq!(agent.ca_path, Some(PathBuf::from("/etc/hangar/ca.pem")));
        assert_eq!(agent.timeouts.control, Duration::from_millis(2500));
    }

    #[test]
    fn test_custom_port_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_DATABASE_URL", "sqlite::memory:");
        guard.set("HANGAR_INSECURE_TRANSPORT", "1");
        guard.set("HANGAR_PORT_RANGE", "30000-30010");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port_range.len(), 11);
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("HANGAR_DATABASE_URL", "sqlite::memory:");
        guard.set("HANGAR_INSECURE_TRANSPORT", "true");

        guard.set("HANGAR_PORT_RANGE", "30010-30000");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("HANGAR_PORT_RANGE", _)
        ));

        guard.set("HANGAR_PORT_RANGE", "25565-25600");
        guard.set("HANGAR_STARTING_BALANCE", "-5");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("HANGAR_STARTING_BALANCE", _)
        ));

        guard.set("HANGAR_STARTING_BALANCE", "100");
        guard.set("HANGAR_PROVISION_TIMEOUT_SECS", "ten");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("HANGAR_PROVISION_TIMEOUT_SECS", _)
        ));
    }
}
