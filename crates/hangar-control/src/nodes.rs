// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node registration and administration.
//!
//! A node is only registered after a probe reaches its daemon with the
//! supplied token. Later calls go through the shared connection registry.

use std::sync::Arc;

use hangar_agent_sdk::{
    AgentClient, AgentError, CallTimeouts, ConnectionRegistry, NodeProbe, NodeStats, ProbeReport,
};
use tracing::{info, instrument, warn};

use crate::error::{ControlError, Result};
use crate::persistence::{NewNode, NodeRecord, Persistence};

/// Input for [`NodeService::register_node`].
#[derive(Debug, Clone)]
pub struct RegisterNode {
    pub name: String,
    pub host: String,
    pub rpc_port: u16,
    pub daemon_token: String,
    /// Taken from the probe's stats when absent.
    pub total_ram_mb: Option<i64>,
    pub total_disk_mb: Option<i64>,
}

impl RegisterNode {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ControlError::validation("name", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ControlError::validation("host", "must not be empty"));
        }
        if self.rpc_port == 0 {
            return Err(ControlError::validation("rpc_port", "must not be zero"));
        }
        if self.daemon_token.is_empty() {
            return Err(ControlError::validation("daemon_token", "must not be empty"));
        }
        for (field, value) in [
            ("total_ram_mb", self.total_ram_mb),
            ("total_disk_mb", self.total_disk_mb),
        ] {
            if value.is_some_and(|v| v < 0) {
                return Err(ControlError::validation(field, "must not be negative"));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NodeService {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ConnectionRegistry>,
    probe: Arc<NodeProbe>,
    timeouts: CallTimeouts,
}

impl NodeService {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<ConnectionRegistry>,
        probe: Arc<NodeProbe>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            persistence,
            registry,
            probe,
            timeouts,
        }
    }

    /// Probe the daemon and persist the node if it is reachable with the token.
    #[instrument(skip(self, request), fields(name = %request.name, address = %request.address()))]
    pub async fn register_node(&self, request: RegisterNode) -> Result<NodeRecord> {
        request.validate()?;

        let address = request.address();
        let report = self.probe.probe(&address, &request.daemon_token).await;
        if !report.is_reachable() {
            return Err(ControlError::ProbeFailed {
                address,
                status: report.status.to_string(),
                message: report.error.unwrap_or_default(),
            });
        }

        let stats = report.stats.as_ref();
        let total_ram_mb = request
            .total_ram_mb
            .or_else(|| stats.map(|s| mb(s.total_memory_mb())))
            .unwrap_or(0);
        let total_disk_mb = request
            .total_disk_mb
            .or_else(|| stats.map(|s| mb(s.total_disk_mb())))
            .unwrap_or(0);

        let node = self
            .persistence
            .insert_node(&NewNode {
                name: request.name,
                host: request.host,
                rpc_port: request.rpc_port,
                daemon_token: request.daemon_token,
                total_ram_mb,
                total_disk_mb,
            })
            .await?;

        info!(node_id = %node.id, total_ram_mb, total_disk_mb, "node registered");
        Ok(node)
    }

    /// Re-run the probe against a registered node.
    #[instrument(skip(self))]
    pub async fn probe_node(&self, node_id: &str) -> Result<ProbeReport> {
        let node = self.get_node(node_id).await?;
        Ok(self.probe.probe(&node.address(), &node.daemon_token).await)
    }

    /// Current host statistics over the node's cached connection.
    #[instrument(skip(self))]
    pub async fn node_stats(&self, node_id: &str) -> Result<NodeStats> {
        let node = self.get_node(node_id).await?;
        let address = node.address();
        let channel = self.registry.get(&address).await?;
        let client = AgentClient::new(channel, node.daemon_token).with_timeouts(self.timeouts);

        match client.node_stats().await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                if matches!(e, AgentError::Transport(_)) {
                    self.registry.remove(&address).await;
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn set_maintenance(&self, node_id: &str, maintenance: bool) -> Result<NodeRecord> {
        if !self
            .persistence
            .set_node_maintenance(node_id, maintenance)
            .await?
        {
            return Err(ControlError::NodeNotFound(node_id.to_string()));
        }
        info!(maintenance, "node maintenance updated");
        self.get_node(node_id).await
    }

    /// Refused while workloads reference the node. Evicts its connection.
    #[instrument(skip(self))]
    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        let node = self.get_node(node_id).await?;

        if !self.persistence.delete_node(node_id).await? {
            return Err(ControlError::NodeNotFound(node_id.to_string()));
        }
        if self.registry.remove(&node.address()).await {
            info!("evicted cached connection");
        }
        info!("node deleted");
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.persistence.list_nodes().await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.persistence
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))
    }
}

fn mb(value: u64) -> i64 {
    i64::try_from(value).unwrap_or_else(|_| {
        warn!(value, "node reported an out-of-range size");
        i64::MAX
    })
}
