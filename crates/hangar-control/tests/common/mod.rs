// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for hangar-control integration tests.
//!
//! Each [`TestContext`] owns a fresh in-memory SQLite store and a mock dialer,
//! so tests never touch a network or each other's data.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hangar_agent_sdk::mock::{MockDaemon, MockDialer};
use hangar_agent_sdk::{AgentConfig, CallTimeouts};
use hangar_control::persistence::{NodeRecord, PoolDelta, SqlitePersistence, UserRecord};
use hangar_control::{ControlPlane, CreateWorkload, PortRange, RegisterNode};

pub const TOKEN: &str = "daemon-token";

/// Short deadlines so hanging-daemon tests finish quickly.
pub fn fast_timeouts() -> CallTimeouts {
    CallTimeouts {
        control: Duration::from_millis(300),
        provision: Duration::from_millis(500),
    }
}

pub struct TestContext {
    pub plane: ControlPlane,
    pub dialer: Arc<MockDialer>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_options(PortRange::default(), 0).await
    }

    pub async fn with_range(range: PortRange) -> Self {
        Self::with_options(range, 0).await
    }

    pub async fn with_starting_balance(amount: i64) -> Self {
        Self::with_options(PortRange::default(), amount).await
    }

    pub async fn with_options(range: PortRange, starting_balance: i64) -> Self {
        let persistence = SqlitePersistence::in_memory()
            .await
            .expect("in-memory sqlite");
        let dialer = Arc::new(MockDialer::new());

        let plane = ControlPlane::builder()
            .persistence(Arc::new(persistence))
            .dialer(dialer.clone())
            .agent_config(AgentConfig::insecure().with_timeouts(fast_timeouts()))
            .port_range(range)
            .stop_grace(Duration::from_secs(1))
            .starting_balance(starting_balance)
            .data_root("/data/volumes")
            .build()
            .expect("control plane");

        Self { plane, dialer }
    }

    /// Bring up a daemon at `host:8443` and register it as node `name`.
    pub async fn add_node(&self, name: &str, host: &str) -> (NodeRecord, Arc<MockDaemon>) {
        self.add_node_with(name, host, MockDaemon::new(TOKEN)).await
    }

    pub async fn add_node_with(
        &self,
        name: &str,
        host: &str,
        daemon: MockDaemon,
    ) -> (NodeRecord, Arc<MockDaemon>) {
        let daemon = self.dialer.add_daemon(format!("{}:8443", host), daemon);
        let node = self
            .plane
            .nodes()
            .register_node(RegisterNode {
                name: name.to_string(),
                host: host.to_string(),
                rpc_port: 8443,
                daemon_token: TOKEN.to_string(),
                total_ram_mb: None,
                total_disk_mb: None,
            })
            .await
            .expect("register node");
        (node, daemon)
    }

    /// A user whose pool comfortably fits a dozen small workloads.
    pub async fn funded_user(&self, username: &str) -> UserRecord {
        let user = self.plane.create_user(username).await.expect("create user");
        self.plane
            .ledger()
            .add_resource_pool(
                &user.id,
                PoolDelta {
                    ram_mb: 64 * 1024,
                    cpu_cores: 32,
                    storage_mb: 1024 * 1024,
                },
            )
            .await
            .expect("add pool");
        user
    }
}

pub fn workload_request(owner: &UserRecord, node: &NodeRecord) -> CreateWorkload {
    let mut env = BTreeMap::new();
    env.insert("EULA".to_string(), "TRUE".to_string());
    CreateWorkload {
        owner_id: owner.id.clone(),
        node_id: node.id.clone(),
        name: "survival".to_string(),
        image: "itzg/minecraft-server:java21".to_string(),
        ram_mb: 1024,
        disk_mb: 4096,
        cpu_percent: 100,
        env,
    }
}
