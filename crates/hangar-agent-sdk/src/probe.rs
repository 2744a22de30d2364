// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connectivity and capability check for nodes outside the registry.
//!
//! A probe dials its own short-lived connection and closes it afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::client::AgentClient;
use crate::config::CallTimeouts;
use crate::error::AgentError;
use crate::transport::Dialer;
use crate::types::NodeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Reachable,
    Unreachable,
    Unauthorized,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Reachable => write!(f, "reachable"),
            ProbeStatus::Unreachable => write!(f, "unreachable"),
            ProbeStatus::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub address: String,
    pub status: ProbeStatus,
    /// Present when the daemon answered the stats call.
    pub stats: Option<NodeStats>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeReport {
    pub fn is_reachable(&self) -> bool {
        self.status == ProbeStatus::Reachable
    }
}

pub struct NodeProbe {
    dialer: Arc<dyn Dialer>,
    timeouts: CallTimeouts,
}

impl NodeProbe {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            timeouts: CallTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Dial, ping with `token`, then fetch stats. Never fails; the outcome is
    /// in the report.
    #[instrument(skip(self, token))]
    pub async fn probe(&self, address: &str, token: &str) -> ProbeReport {
        let report =
            |status: ProbeStatus, stats: Option<NodeStats>, error: Option<String>| ProbeReport {
                address: address.to_string(),
                status,
                stats,
                error,
                checked_at: Utc::now(),
            };

        let channel = match self.dialer.dial(address).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "probe dial failed");
                return report(ProbeStatus::Unreachable, None, Some(e.to_string()));
            }
        };
        let client = AgentClient::new(channel.clone(), token).with_timeouts(self.timeouts);

        let result = match client.ping().await {
            Ok(_) => match client.node_stats().await {
                Ok(stats) => report(ProbeStatus::Reachable, Some(stats), None),
                Err(e) => report(
                    ProbeStatus::Reachable,
                    None,
                    Some(format!("stats unavailable: {}", e)),
                ),
            },
            Err(e @ AgentError::Unauthenticated(_)) => {
                report(ProbeStatus::Unauthorized, None, Some(e.to_string()))
            }
            Err(e) => report(ProbeStatus::Unreachable, None, Some(e.to_string())),
        };

        channel.close();
        info!(status = %result.status, "probe finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDaemon, MockDialer};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reachable_with_stats() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("n:8443", MockDaemon::new("tok"));
        let probe = NodeProbe::new(dialer);

        let report = probe.probe("n:8443", "tok").await;
        assert!(report.is_reachable());
        assert!(report.stats.is_some());
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_when_dial_fails() {
        let probe = NodeProbe::new(Arc::new(MockDialer::new()));
        let report = probe.probe("gone:8443", "tok").await;
        assert_eq!(report.status, ProbeStatus::Unreachable);
        assert!(report.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unauthorized_on_bad_token() {
        let dialer = Arc::new(MockDialer::new());
        let daemon = dialer.add_daemon("n:8443", MockDaemon::new("tok"));
        let probe = NodeProbe::new(dialer);

        let report = probe.probe("n:8443", "wrong").await;
        assert_eq!(report.status, ProbeStatus::Unauthorized);
        assert!(daemon.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stats_failure_still_reachable() {
        let dialer = Arc::new(MockDialer::new());
        let daemon = dialer.add_daemon("n:8443", MockDaemon::new("tok"));
        daemon.set_stats_fail(true);
        let probe = NodeProbe::new(dialer);

        let report = probe.probe("n:8443", "tok").await;
        assert_eq!(report.status, ProbeStatus::Reachable);
        assert!(report.stats.is_none());
        assert!(report.error.unwrap().starts_with("stats unavailable"));
    }

    #[tokio::test]
    async fn test_silent_daemon_is_unreachable() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("n:8443", MockDaemon::new("tok").hanging());
        let probe = NodeProbe::new(dialer).with_timeouts(CallTimeouts {
            control: Duration::from_millis(20),
            provision: Duration::from_millis(20),
        });

        let report = probe.probe("n:8443", "tok").await;
        assert_eq!(report.status, ProbeStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_probe_does_not_reuse_connections() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("n:8443", MockDaemon::new("tok"));
        let probe = NodeProbe::new(dialer.clone());

        probe.probe("n:8443", "tok").await;
        probe.probe("n:8443", "tok").await;
        assert_eq!(dialer.dial_count(), 2);
    }
}
