// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane.
//!
//! [`ControlPlane`] wires the store, the connection registry and the
//! services that share them. Products embed it and call the services from
//! their own request handlers.
//!
//! ```rust,ignore
//! use hangar_control::{Config, runtime::ControlPlane};
//!
//! let config = Config::from_env()?;
//! let plane = ControlPlane::connect(&config).await?;
//!
//! let node = plane.nodes().register_node(request).await?;
//! // ...
//! plane.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use hangar_agent_sdk::{AgentConfig, ConnectionRegistry, Dialer, NodeProbe, QuicDialer};
use tracing::{info, instrument};

use crate::allocation::{PortAllocator, PortRange};
use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::ledger::Ledger;
use crate::lifecycle::Orchestrator;
use crate::nodes::NodeService;
use crate::persistence::{self, Persistence, UserRecord};

/// Builder for a [`ControlPlane`].
pub struct ControlPlaneBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    dialer: Option<Arc<dyn Dialer>>,
    agent: AgentConfig,
    port_range: PortRange,
    stop_grace: Duration,
    starting_balance: i64,
    data_root: String,
}

impl std::fmt::Debug for ControlPlaneBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("dialer", &self.dialer.as_ref().map(|_| "..."))
            .field("port_range", &self.port_range)
            .field("stop_grace", &self.stop_grace)
            .field("starting_balance", &self.starting_balance)
            .field("data_root", &self.data_root)
            .finish()
    }
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            dialer: None,
            agent: AgentConfig::default(),
            port_range: PortRange::default(),
            stop_grace: Duration::from_secs(30),
            starting_balance: 0,
            data_root: "/srv/hangar/volumes".to_string(),
        }
    }
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything except the store, taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            persistence: None,
            dialer: None,
            agent: config.agent_config(),
            port_range: config.port_range,
            stop_grace: config.stop_grace,
            starting_balance: config.starting_balance,
            data_root: config.data_root.clone(),
        }
    }

    /// Set the store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Replace the QUIC dialer, e.g. with a mock in tests.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn agent_config(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Default: `25565-25600`
    pub fn port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn starting_balance(mut self, amount: i64) -> Self {
        self.starting_balance = amount;
        self
    }

    pub fn data_root(mut self, data_root: impl Into<String>) -> Self {
        self.data_root = data_root.into();
        self
    }

    pub fn build(self) -> Result<ControlPlane> {
        let persistence = self
            .persistence
            .ok_or_else(|| ControlError::validation("persistence", "persistence is required"))?;
        if self.starting_balance < 0 {
            return Err(ControlError::validation(
                "starting_balance",
                "must not be negative",
            ));
        }

        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(QuicDialer::new(&self.agent)?),
        };
        let timeouts = self.agent.timeouts;

        let registry = Arc::new(ConnectionRegistry::new(dialer.clone()));
        let probe = Arc::new(NodeProbe::new(dialer).with_timeouts(timeouts));
        let allocator = PortAllocator::new(persistence.clone(), self.port_range);

        let nodes = NodeService::new(persistence.clone(), registry.clone(), probe, timeouts);
        let ledger = Ledger::new(persistence.clone());
        let orchestrator = Orchestrator::new(persistence.clone(), registry.clone(), allocator)
            .with_timeouts(timeouts)
            .with_stop_grace(self.stop_grace)
            .with_data_root(self.data_root);

        Ok(ControlPlane {
            persistence,
            registry,
            nodes,
            ledger,
            orchestrator,
            starting_balance: self.starting_balance,
        })
    }
}

/// The assembled control plane.
pub struct ControlPlane {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ConnectionRegistry>,
    nodes: NodeService,
    ledger: Ledger,
    orchestrator: Orchestrator,
    starting_balance: i64,
}

impl ControlPlane {
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Open the configured store, run migrations and build with QUIC transport.
    pub async fn connect(config: &Config) -> Result<Self> {
        let persistence = persistence::connect(&config.database_url).await?;
        ControlPlaneBuilder::from_config(config)
            .persistence(persistence)
            .build()
    }

    pub fn nodes(&self) -> &NodeService {
        &self.nodes
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn workloads(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Create a user with an empty pool and the starting balance.
    #[instrument(skip(self))]
    pub async fn create_user(&self, username: &str) -> Result<UserRecord> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ControlError::validation("username", "must not be empty"));
        }
        let user = self
            .persistence
            .create_user(username, self.starting_balance)
            .await?;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserRecord> {
        self.persistence
            .get_user(user_id)
            .await?
            .ok_or_else(|| ControlError::UserNotFound(user_id.to_string()))
    }

    /// Close every cached node connection.
    pub async fn shutdown(&self) {
        info!("control plane shutting down");
        self.registry.close_all().await;
    }
}
