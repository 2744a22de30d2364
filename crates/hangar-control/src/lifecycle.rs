// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload lifecycle orchestration.
//!
//! Creation persists the workload, assigns its port and then provisions it on
//! the node from a detached task, so the caller never waits on the remote
//! install. Every other operation is a single RPC whose success decides the
//! new status; a failed RPC leaves the persisted status untouched. Delete is
//! the exception: local state is removed whatever the node answers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hangar_agent_sdk::{
    AgentClient, AgentError, CallTimeouts, CommandOutput, ConnectionRegistry, LogSnapshot,
    PortBinding, RpcOutcome, WorkloadSpec,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::allocation::{PortAllocator, PortRange};
use crate::error::{ControlError, Result};
use crate::persistence::{
    AllocationRecord, NewWorkload, NodeRecord, Persistence, WorkloadFilter, WorkloadRecord,
};
use crate::status::{Operation, WorkloadStatus};

/// Input for [`Orchestrator::create`].
#[derive(Debug, Clone)]
pub struct CreateWorkload {
    pub owner_id: String,
    pub node_id: String,
    pub name: String,
    pub image: String,
    pub ram_mb: i64,
    pub disk_mb: i64,
    /// 100 equals one full core.
    pub cpu_percent: i32,
    pub env: BTreeMap<String, String>,
}

impl CreateWorkload {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ControlError::validation("name", "must not be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(ControlError::validation("image", "must not be empty"));
        }
        if self.ram_mb <= 0 {
            return Err(ControlError::validation("ram_mb", "must be greater than zero"));
        }
        if self.disk_mb <= 0 {
            return Err(ControlError::validation("disk_mb", "must be greater than zero"));
        }
        if self.cpu_percent <= 0 {
            return Err(ControlError::validation(
                "cpu_percent",
                "must be greater than zero",
            ));
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(ControlError::validation("env", "invalid variable name"));
        }
        Ok(())
    }
}

/// Result of a create or allocation retry.
#[derive(Debug)]
pub struct CreatedWorkload {
    /// The record as persisted before provisioning started.
    pub workload: WorkloadRecord,
    /// `None` when no port could be assigned.
    pub allocation: Option<AllocationRecord>,
    /// The detached provisioning task, if one was launched.
    pub provisioning: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ConnectionRegistry>,
    allocator: PortAllocator,
    timeouts: CallTimeouts,
    stop_grace: Duration,
    data_root: String,
}

impl Orchestrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<ConnectionRegistry>,
        allocator: PortAllocator,
    ) -> Self {
        Self {
            persistence,
            registry,
            allocator,
            timeouts: CallTimeouts::default(),
            stop_grace: Duration::from_secs(30),
            data_root: "/srv/hangar/volumes".to_string(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_data_root(mut self, data_root: impl Into<String>) -> Self {
        self.data_root = data_root.into();
        self
    }

    /// Host directory mounted into the workload's container.
    pub fn data_directory(&self, workload_id: &str) -> String {
        format!("{}/{}", self.data_root.trim_end_matches('/'), workload_id)
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Persist a new workload in `installing`, assign its port and launch
    /// provisioning in the background.
    ///
    /// Port exhaustion does not fail the call: the workload is returned
    /// without an allocation and no provisioning task.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id, node_id = %request.node_id))]
    pub async fn create(&self, request: CreateWorkload) -> Result<CreatedWorkload> {
        request.validate()?;

        let node = self.require_node(&request.node_id).await?;
        if node.maintenance {
            return Err(ControlError::NodeInMaintenance(node.id));
        }
        if self.persistence.get_user(&request.owner_id).await?.is_none() {
            return Err(ControlError::UserNotFound(request.owner_id));
        }

        let workload = self
            .persistence
            .insert_workload(&NewWorkload {
                owner_id: request.owner_id,
                node_id: request.node_id,
                name: request.name,
                image: request.image,
                ram_mb: request.ram_mb,
                disk_mb: request.disk_mb,
                cpu_percent: request.cpu_percent,
                env: request.env,
            })
            .await?;
        info!(workload_id = %workload.id, "workload persisted");

        let allocation = match self.allocator.assign(&workload.id, &node.id).await {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    workload_id = %workload.id,
                    error = %e,
                    "no port assigned, provisioning deferred"
                );
                return Ok(CreatedWorkload {
                    workload,
                    allocation: None,
                    provisioning: None,
                });
            }
        };

        self.launch(workload.id.clone(), node, allocation).await
    }

    /// Assign a port to an `installing` workload that has none, optionally
    /// from a different range, then provision it.
    #[instrument(skip(self))]
    pub async fn retry_allocation(
        &self,
        workload_id: &str,
        range: Option<PortRange>,
    ) -> Result<CreatedWorkload> {
        let workload = self.require_workload(workload_id).await?;
        if workload.status()? != WorkloadStatus::Installing {
            return Err(ControlError::validation(
                "workload_id",
                format!("workload is {}, not installing", workload.status),
            ));
        }
        if workload.primary_allocation_id.is_some() {
            return Err(ControlError::validation(
                "workload_id",
                "workload already has a primary allocation",
            ));
        }

        let node = self.require_node(&workload.node_id).await?;
        let allocator = match range {
            Some(range) => self.allocator.with_range(range),
            None => self.allocator.clone(),
        };
        let allocation = allocator.assign(&workload.id, &node.id).await?;

        self.launch(workload.id, node, allocation).await
    }

    async fn launch(
        &self,
        workload_id: String,
        node: NodeRecord,
        allocation: AllocationRecord,
    ) -> Result<CreatedWorkload> {
        // Re-read so the returned record carries the primary allocation and
        // predates anything the background task writes.
        let workload = self.require_workload(&workload_id).await?;

        let this = self.clone();
        let task_workload = workload.clone();
        let provisioning = tokio::spawn(async move {
            this.provision(task_workload, node).await;
        });

        Ok(CreatedWorkload {
            workload,
            allocation: Some(allocation),
            provisioning: Some(provisioning),
        })
    }

    /// Ends in `running` on success and `offline` on any failure.
    #[instrument(skip(self, workload, node), fields(workload_id = %workload.id, node_id = %node.id))]
    async fn provision(&self, workload: WorkloadRecord, node: NodeRecord) {
        let (status, container_id) = match self.request_provisioning(&workload, &node).await {
            Ok(outcome) if outcome.success => {
                info!(container_id = ?outcome.container_id, "workload provisioned");
                (WorkloadStatus::Running, outcome.container_id)
            }
            Ok(outcome) => {
                warn!(reason = %outcome.failure_reason(), "node rejected provisioning");
                (WorkloadStatus::Offline, None)
            }
            Err(e) => {
                warn!(error = %e, "provisioning failed");
                (WorkloadStatus::Offline, None)
            }
        };

        match self
            .persistence
            .update_workload_status(&workload.id, status, container_id.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) if status == WorkloadStatus::Running => {
                warn!("workload deleted during provisioning, removing its container");
                self.remove_orphan(&workload, &node).await;
            }
            Ok(false) => debug!("workload deleted during provisioning"),
            Err(e) => error!(error = %e, status = %status, "failed to record provisioning result"),
        }
    }

    /// The record is gone, so its port may already be handed out again; the
    /// container created for it must not keep running.
    async fn remove_orphan(&self, workload: &WorkloadRecord, node: &NodeRecord) {
        match self.teardown(workload, node).await {
            Ok(outcome) if outcome.success => info!("orphaned container removed"),
            Ok(outcome) => {
                warn!(reason = %outcome.failure_reason(), "node refused to remove orphaned container")
            }
            Err(e) => warn!(error = %e, "failed to remove orphaned container"),
        }
    }

    async fn request_provisioning(
        &self,
        workload: &WorkloadRecord,
        node: &NodeRecord,
    ) -> Result<RpcOutcome> {
        let ports = self
            .persistence
            .list_allocations(&workload.id)
            .await?
            .into_iter()
            .filter_map(|allocation| {
                let port = u16::try_from(allocation.port).ok()?;
                Some(PortBinding {
                    port,
                    is_primary: workload.primary_allocation_id.as_deref()
                        == Some(allocation.id.as_str()),
                })
            })
            .collect();

        let spec = WorkloadSpec {
            id: workload.id.clone(),
            name: workload.name.clone(),
            image: workload.image.clone(),
            memory_mb: u64::try_from(workload.ram_mb).unwrap_or_default(),
            disk_mb: u64::try_from(workload.disk_mb).unwrap_or_default(),
            cpu_percent: u32::try_from(workload.cpu_percent).unwrap_or_default(),
            ports,
            env: workload.env_map()?,
            data_directory: self.data_directory(&workload.id),
        };

        let client = self.client_for(node).await?;
        let outcome = client.create_workload(&spec).await;
        Ok(self.observe(node, outcome).await?)
    }

    // ========================================================================
    // Control operations
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn start(&self, workload_id: &str) -> Result<WorkloadRecord> {
        let (workload, node, next) = self.prepare(workload_id, Operation::Start).await?;
        let client = self.client_for(&node).await?;
        let outcome = self
            .observe(&node, client.start_workload(&workload.id).await)
            .await?;
        self.settle(&workload, Operation::Start, next, outcome).await
    }

    /// Stop with the configured grace period.
    #[instrument(skip(self))]
    pub async fn stop(&self, workload_id: &str) -> Result<WorkloadRecord> {
        let (workload, node, next) = self.prepare(workload_id, Operation::Stop).await?;
        let client = self.client_for(&node).await?;
        let outcome = self
            .observe(
                &node,
                client.stop_workload(&workload.id, self.stop_grace).await,
            )
            .await?;
        self.settle(&workload, Operation::Stop, next, outcome).await
    }

    #[instrument(skip(self))]
    pub async fn restart(&self, workload_id: &str) -> Result<WorkloadRecord> {
        let (workload, node, next) = self.prepare(workload_id, Operation::Restart).await?;
        let client = self.client_for(&node).await?;
        let outcome = self
            .observe(&node, client.restart_workload(&workload.id).await)
            .await?;
        self.settle(&workload, Operation::Restart, next, outcome).await
    }

    /// Send a console command to a running workload.
    #[instrument(skip(self, command))]
    pub async fn send_command(&self, workload_id: &str, command: &str) -> Result<CommandOutput> {
        if command.trim().is_empty() {
            return Err(ControlError::validation("command", "must not be empty"));
        }

        let (workload, node, _) = self.prepare(workload_id, Operation::SendCommand).await?;
        let client = self.client_for(&node).await?;
        let output = self
            .observe(&node, client.send_command(&workload.id, command).await)
            .await?;

        if !output.success {
            return Err(ControlError::Remote {
                operation: "send_command".to_string(),
                message: output.output,
            });
        }
        Ok(output)
    }

    #[instrument(skip(self))]
    pub async fn fetch_logs(&self, workload_id: &str) -> Result<LogSnapshot> {
        let (workload, node, _) = self.prepare(workload_id, Operation::FetchLogs).await?;
        let client = self.client_for(&node).await?;
        let logs = self
            .observe(&node, client.get_logs(&workload.id).await)
            .await?;

        if !logs.success {
            return Err(ControlError::Remote {
                operation: "get_logs".to_string(),
                message: logs.text,
            });
        }
        Ok(logs)
    }

    /// Administrative hold. A running workload is stopped on its node first.
    #[instrument(skip(self))]
    pub async fn suspend(&self, workload_id: &str) -> Result<WorkloadRecord> {
        let workload = self.require_workload(workload_id).await?;
        let current = workload.status()?;
        let next = current.apply(&workload.id, Operation::Suspend)?;

        if current == WorkloadStatus::Running {
            let node = self.require_node(&workload.node_id).await?;
            let client = self.client_for(&node).await?;
            let outcome = self
                .observe(
                    &node,
                    client.stop_workload(&workload.id, self.stop_grace).await,
                )
                .await?;
            if !outcome.success {
                return Err(ControlError::Remote {
                    operation: Operation::Suspend.to_string(),
                    message: outcome.failure_reason(),
                });
            }
        }

        self.record_status(&workload.id, next).await
    }

    /// Lift a suspension. The workload comes back `offline`.
    #[instrument(skip(self))]
    pub async fn unsuspend(&self, workload_id: &str) -> Result<WorkloadRecord> {
        let workload = self.require_workload(workload_id).await?;
        let next = workload.status()?.apply(&workload.id, Operation::Unsuspend)?;
        self.record_status(&workload.id, next).await
    }

    /// Ask the node to remove the container, then delete the local record,
    /// its allocations and its share of the node counters regardless of the
    /// node's answer.
    #[instrument(skip(self))]
    pub async fn delete(&self, workload_id: &str) -> Result<()> {
        let workload = self.require_workload(workload_id).await?;

        match self.require_node(&workload.node_id).await {
            Ok(node) => match self.teardown(&workload, &node).await {
                Ok(outcome) if outcome.success => debug!("node removed container"),
                Ok(outcome) => {
                    warn!(reason = %outcome.failure_reason(), "node refused teardown, deleting anyway")
                }
                Err(e) => warn!(error = %e, "teardown failed, deleting anyway"),
            },
            Err(e) => warn!(error = %e, "node missing, deleting anyway"),
        }

        if !self.persistence.delete_workload(&workload.id).await? {
            return Err(ControlError::WorkloadNotFound(workload.id));
        }
        info!("workload deleted");
        Ok(())
    }

    async fn teardown(&self, workload: &WorkloadRecord, node: &NodeRecord) -> Result<RpcOutcome> {
        let client = self.client_for(node).await?;
        Ok(self
            .observe(node, client.delete_workload(&workload.id).await)
            .await?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, workload_id: &str) -> Result<WorkloadRecord> {
        self.require_workload(workload_id).await
    }

    pub async fn list(&self, filter: &WorkloadFilter) -> Result<Vec<WorkloadRecord>> {
        self.persistence.list_workloads(filter).await
    }

    pub async fn allocations(&self, workload_id: &str) -> Result<Vec<AllocationRecord>> {
        self.require_workload(workload_id).await?;
        self.persistence.list_allocations(workload_id).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn require_workload(&self, workload_id: &str) -> Result<WorkloadRecord> {
        self.persistence
            .get_workload(workload_id)
            .await?
            .ok_or_else(|| ControlError::WorkloadNotFound(workload_id.to_string()))
    }

    async fn require_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.persistence
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))
    }

    /// Resolve the workload and its node and check `op` is allowed.
    async fn prepare(
        &self,
        workload_id: &str,
        op: Operation,
    ) -> Result<(WorkloadRecord, NodeRecord, WorkloadStatus)> {
        let workload = self.require_workload(workload_id).await?;
        let next = workload.status()?.apply(&workload.id, op)?;
        let node = self.require_node(&workload.node_id).await?;
        Ok((workload, node, next))
    }

    async fn client_for(&self, node: &NodeRecord) -> Result<AgentClient> {
        let channel = self.registry.get(&node.address()).await?;
        Ok(AgentClient::new(channel, node.daemon_token.clone()).with_timeouts(self.timeouts))
    }

    /// Drop the cached connection when a call shows it is broken.
    async fn observe<T>(
        &self,
        node: &NodeRecord,
        result: hangar_agent_sdk::Result<T>,
    ) -> hangar_agent_sdk::Result<T> {
        if let Err(AgentError::Transport(message)) = &result {
            warn!(node_id = %node.id, error = %message, "evicting broken node connection");
            self.registry.remove(&node.address()).await;
        }
        result
    }

    async fn settle(
        &self,
        workload: &WorkloadRecord,
        op: Operation,
        next: WorkloadStatus,
        outcome: RpcOutcome,
    ) -> Result<WorkloadRecord> {
        if !outcome.success {
            return Err(ControlError::Remote {
                operation: op.to_string(),
                message: outcome.failure_reason(),
            });
        }
        self.record_status(&workload.id, next).await
    }

    async fn record_status(&self, workload_id: &str, status: WorkloadStatus) -> Result<WorkloadRecord> {
        if !self
            .persistence
            .update_workload_status(workload_id, status, None)
            .await?
        {
            return Err(ControlError::WorkloadNotFound(workload_id.to_string()));
        }
        info!(workload_id, status = %status, "workload status updated");
        self.require_workload(workload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateWorkload {
        CreateWorkload {
            owner_id: "u".into(),
            node_id: "n".into(),
            name: "survival".into(),
            image: "itzg/minecraft-server".into(),
            ram_mb: 1024,
            disk_mb: 2048,
            cpu_percent: 100,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_validate_accepts_sane_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut r = request();
        r.ram_mb = 0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.cpu_percent = -5;
        assert!(r.validate().is_err());

        let mut r = request();
        r.name = "  ".into();
        assert!(r.validate().is_err());

        let mut r = request();
        r.env.insert("A=B".into(), "x".into());
        assert!(r.validate().is_err());
    }
}
