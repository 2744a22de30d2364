// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for hangar-control.
//!
//! The relational store is the record of truth for nodes, workloads, port
//! allocations and user entitlements. Every multi-row change runs in one
//! transaction so that concurrent requests cannot double-allocate.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::allocation::PortRange;
use crate::error::ControlError;
use crate::status::WorkloadStatus;

/// A registered remote host.
#[derive(Clone, sqlx::FromRow, Serialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub rpc_port: i32,
    /// Bearer credential presented on every call to this node.
    #[serde(skip_serializing)]
    pub daemon_token: String,
    pub total_ram_mb: i64,
    pub allocated_ram_mb: i64,
    pub total_disk_mb: i64,
    pub allocated_disk_mb: i64,
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// `host:rpc_port`, the key used by the connection registry.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address())
            .field("allocated_ram_mb", &self.allocated_ram_mb)
            .field("total_ram_mb", &self.total_ram_mb)
            .field("maintenance", &self.maintenance)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub rpc_port: u16,
    pub daemon_token: String,
    pub total_ram_mb: i64,
    pub total_disk_mb: i64,
}

/// One game-server instance.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WorkloadRecord {
    pub id: String,
    pub owner_id: String,
    pub node_id: String,
    pub name: String,
    pub image: String,
    pub ram_mb: i64,
    pub disk_mb: i64,
    /// 100 equals one full core.
    pub cpu_percent: i32,
    /// installing, starting, running, stopping, offline or suspended.
    pub status: String,
    pub primary_allocation_id: Option<String>,
    /// Container handle reported by the daemon on create.
    pub container_id: Option<String>,
    /// Environment as a JSON object.
    pub env: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkloadRecord {
    pub fn status(&self) -> Result<WorkloadStatus, ControlError> {
        self.status.parse()
    }

    pub fn env_map(&self) -> Result<BTreeMap<String, String>, ControlError> {
        Ok(serde_json::from_str(&self.env)?)
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkload {
    pub owner_id: String,
    pub node_id: String,
    pub name: String,
    pub image: String,
    pub ram_mb: i64,
    pub disk_mb: i64,
    pub cpu_percent: i32,
    pub env: BTreeMap<String, String>,
}

/// A (node, port) reservation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AllocationRecord {
    pub id: String,
    pub node_id: String,
    pub workload_id: Option<String>,
    pub ip: String,
    pub port: i32,
    pub assigned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A user's balances and resource ceiling.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ResourcePoolRecord {
    pub user_id: String,
    pub granted_balance: i64,
    pub earned_balance: i64,
    pub pool_ram_mb: i64,
    pub pool_cpu_cores: i64,
    pub pool_storage_mb: i64,
    pub updated_at: DateTime<Utc>,
}

impl ResourcePoolRecord {
    pub fn total_balance(&self) -> i64 {
        self.earned_balance + self.granted_balance
    }
}

/// Immutable record of one balance movement.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LedgerEntryRecord {
    pub id: String,
    pub user_id: String,
    /// `grant` or `spend`.
    pub kind: String,
    /// `earned` or `granted`.
    pub balance: String,
    pub amount: i64,
    pub source: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Sum of a user's workload limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct ResourceUsage {
    pub ram_mb: i64,
    pub cpu_percent: i64,
    pub disk_mb: i64,
}

/// Which balance a grant credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    Earned,
    Granted,
}

impl BalanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceKind::Earned => "earned",
            BalanceKind::Granted => "granted",
        }
    }
}

/// Increase to a user's resource ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolDelta {
    pub ram_mb: i64,
    pub cpu_cores: i64,
    pub storage_mb: i64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadFilter {
    pub owner_id: Option<String>,
    pub node_id: Option<String>,
}

/// Persistence interface for the control plane.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ----- nodes -----

    async fn insert_node(&self, node: &NewNode) -> Result<NodeRecord, ControlError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, ControlError>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ControlError>;

    /// Returns false if the node does not exist.
    async fn set_node_maintenance(
        &self,
        node_id: &str,
        maintenance: bool,
    ) -> Result<bool, ControlError>;

    /// Fails with `NodeInUse` while any workload references the node.
    async fn delete_node(&self, node_id: &str) -> Result<bool, ControlError>;

    // ----- users and entitlements -----

    /// Create the user with an empty pool and `starting_grant` granted currency.
    async fn create_user(
        &self,
        username: &str,
        starting_grant: i64,
    ) -> Result<UserRecord, ControlError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ControlError>;

    async fn get_resource_pool(
        &self,
        user_id: &str,
    ) -> Result<Option<ResourcePoolRecord>, ControlError>;

    /// Credit `amount` to one balance and record it.
    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        balance: BalanceKind,
        source: &str,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError>;

    /// Debit `amount`, earned first, then granted. Nothing changes on failure.
    async fn spend(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError>;

    async fn add_resource_pool(
        &self,
        user_id: &str,
        delta: PoolDelta,
    ) -> Result<ResourcePoolRecord, ControlError>;

    /// Debit `cost` and raise the pool by `delta` in one transaction.
    async fn purchase_resources(
        &self,
        user_id: &str,
        cost: i64,
        delta: PoolDelta,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError>;

    async fn resource_usage(&self, user_id: &str) -> Result<ResourceUsage, ControlError>;

    /// Most recent entries first.
    async fn list_ledger_entries(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntryRecord>, ControlError>;

    // ----- workloads -----

    /// Insert in `installing`, after checking the owner's pool has room, and
    /// add the limits to the node's allocated counters.
    async fn insert_workload(
        &self,
        workload: &NewWorkload,
    ) -> Result<WorkloadRecord, ControlError>;

    async fn get_workload(&self, workload_id: &str)
    -> Result<Option<WorkloadRecord>, ControlError>;

    async fn list_workloads(
        &self,
        filter: &WorkloadFilter,
    ) -> Result<Vec<WorkloadRecord>, ControlError>;

    /// Set the status; `container_id` is only written when given. Returns
    /// false if the workload no longer exists.
    async fn update_workload_status(
        &self,
        workload_id: &str,
        status: WorkloadStatus,
        container_id: Option<&str>,
    ) -> Result<bool, ControlError>;

    /// Remove the workload, release its allocations and give its limits back
    /// to the node's counters.
    async fn delete_workload(&self, workload_id: &str) -> Result<bool, ControlError>;

    // ----- allocations -----

    /// Reserve the lowest free port in `range` on `node_id` and bind it to the
    /// workload, as its primary allocation if it has none.
    async fn assign_port(
        &self,
        workload_id: &str,
        node_id: &str,
        range: &PortRange,
    ) -> Result<AllocationRecord, ControlError>;

    async fn get_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Option<AllocationRecord>, ControlError>;

    async fn list_allocations(
        &self,
        workload_id: &str,
    ) -> Result<Vec<AllocationRecord>, ControlError>;

    async fn health_check_db(&self) -> Result<bool, ControlError>;
}

/// Open the store named by `database_url` and run its migrations.
///
/// `postgres://` and `postgresql://` select PostgreSQL; `sqlite:` selects
/// SQLite.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>, ControlError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresPersistence::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqlitePersistence::connect(database_url).await?))
    } else {
        Err(ControlError::validation(
            "database_url",
            "expected a postgres:// or sqlite: URL",
        ))
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Room left in the pool for a new workload, or the first exhausted resource.
pub(crate) fn check_pool(
    pool: &ResourcePoolRecord,
    usage: &ResourceUsage,
    ram_mb: i64,
    cpu_percent: i64,
    disk_mb: i64,
) -> Result<(), ControlError> {
    let checks = [
        ("ram_mb", pool.pool_ram_mb, usage.ram_mb, ram_mb),
        (
            "cpu_percent",
            pool.pool_cpu_cores * 100,
            usage.cpu_percent,
            cpu_percent,
        ),
        ("disk_mb", pool.pool_storage_mb, usage.disk_mb, disk_mb),
    ];
    for (resource, ceiling, used, requested) in checks {
        if used + requested > ceiling {
            return Err(ControlError::ResourcePoolExhausted {
                resource,
                requested,
                available: (ceiling - used).max(0),
            });
        }
    }
    Ok(())
}
