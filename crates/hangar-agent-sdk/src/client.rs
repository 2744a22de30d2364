// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed client for one node daemon.

use std::sync::Arc;
use std::time::Duration;

use hangar_protocol::agent_proto::{
    self, AgentRequest, UNAUTHENTICATED, agent_request::Request, agent_response::Response,
};
use tracing::{debug, instrument, warn};

use crate::config::CallTimeouts;
use crate::error::{AgentError, Result};
use crate::transport::RpcChannel;
use crate::types::{CommandOutput, LogSnapshot, NodeStats, RpcOutcome, WorkloadSpec};

/// Issues agent RPCs over a shared channel, attaching the node's daemon token
/// to every call.
#[derive(Clone)]
pub struct AgentClient {
    channel: Arc<dyn RpcChannel>,
    token: String,
    timeouts: CallTimeouts,
}

impl AgentClient {
    pub fn new(channel: Arc<dyn RpcChannel>, token: impl Into<String>) -> Self {
        Self {
            channel,
            token: token.into(),
            timeouts: CallTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let operation = request.name();
        let envelope = AgentRequest {
            token: self.token.clone(),
            request: Some(request),
        };

        let response = self.channel.call(envelope, timeout).await?;
        match response.response {
            Some(Response::Error(e)) if e.code == UNAUTHENTICATED => {
                warn!(operation, "daemon rejected credential");
                Err(AgentError::Unauthenticated(e.message))
            }
            Some(Response::Error(e)) => Err(AgentError::Remote {
                code: e.code,
                message: e.message,
            }),
            Some(response) => Ok(response),
            None => Err(unexpected(operation, "empty response")),
        }
    }

    /// Verify reachability and credential.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<String> {
        match self
            .call(Request::Ping(agent_proto::PingRequest {}), self.timeouts.control)
            .await?
        {
            Response::Ping(p) => Ok(p.version),
            other => Err(mismatch("ping", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn node_stats(&self) -> Result<NodeStats> {
        match self
            .call(
                Request::GetNodeStats(agent_proto::GetNodeStatsRequest {}),
                self.timeouts.control,
            )
            .await?
        {
            Response::NodeStats(stats) => Ok(stats.into()),
            other => Err(mismatch("get_node_stats", &other)),
        }
    }

    /// Provision a container. Uses the long provisioning deadline.
    #[instrument(skip(self, spec), fields(workload_id = %spec.id))]
    pub async fn create_workload(&self, spec: &WorkloadSpec) -> Result<RpcOutcome> {
        match self
            .call(Request::CreateWorkload(spec.into()), self.timeouts.provision)
            .await?
        {
            Response::CreateWorkload(r) => {
                debug!(success = r.success, "create_workload answered");
                Ok(r.into())
            }
            other => Err(mismatch("create_workload", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn start_workload(&self, workload_id: &str) -> Result<RpcOutcome> {
        self.action(Request::StartWorkload(workload_ref(workload_id)), self.timeouts.control)
            .await
    }

    /// Stop with a grace period; the deadline is extended by the same amount.
    #[instrument(skip(self))]
    pub async fn stop_workload(&self, workload_id: &str, grace: Duration) -> Result<RpcOutcome> {
        let request = Request::StopWorkload(agent_proto::StopWorkloadRequest {
            workload_id: workload_id.to_string(),
            timeout_seconds: u32::try_from(grace.as_secs()).unwrap_or(u32::MAX),
        });
        self.action(request, self.timeouts.control + grace).await
    }

    #[instrument(skip(self))]
    pub async fn restart_workload(&self, workload_id: &str) -> Result<RpcOutcome> {
        self.action(Request::RestartWorkload(workload_ref(workload_id)), self.timeouts.control)
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_workload(&self, workload_id: &str) -> Result<RpcOutcome> {
        self.action(Request::DeleteWorkload(workload_ref(workload_id)), self.timeouts.control)
            .await
    }

    #[instrument(skip(self, command))]
    pub async fn send_command(&self, workload_id: &str, command: &str) -> Result<CommandOutput> {
        let request = Request::SendCommand(agent_proto::SendCommandRequest {
            workload_id: workload_id.to_string(),
            command: command.to_string(),
        });
        match self.call(request, self.timeouts.control).await? {
            Response::Command(r) => Ok(CommandOutput {
                success: r.success,
                output: r.output,
            }),
            other => Err(mismatch("send_command", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_logs(&self, workload_id: &str) -> Result<LogSnapshot> {
        let request = Request::GetLogs(agent_proto::GetLogsRequest {
            workload_id: workload_id.to_string(),
        });
        match self.call(request, self.timeouts.control).await? {
            Response::Logs(r) => Ok(LogSnapshot {
                success: r.success,
                text: r.text,
            }),
            other => Err(mismatch("get_logs", &other)),
        }
    }

    async fn action(&self, request: Request, timeout: Duration) -> Result<RpcOutcome> {
        let operation = request.name();
        match self.call(request, timeout).await? {
            Response::Action(r) => Ok(r.into()),
            other => Err(mismatch(operation, &other)),
        }
    }
}

fn workload_ref(workload_id: &str) -> agent_proto::WorkloadRef {
    agent_proto::WorkloadRef {
        workload_id: workload_id.to_string(),
    }
}

fn unexpected(operation: &str, detail: impl Into<String>) -> AgentError {
    AgentError::UnexpectedResponse {
        operation: operation.to_string(),
        detail: detail.into(),
    }
}

fn mismatch(operation: &str, response: &Response) -> AgentError {
    let kind = match response {
        Response::Ping(_) => "ping",
        Response::NodeStats(_) => "node_stats",
        Response::CreateWorkload(_) => "create_workload",
        Response::Action(_) => "action",
        Response::Command(_) => "command",
        Response::Logs(_) => "logs",
        Response::Error(_) => "error",
    };
    unexpected(operation, format!("got {} response", kind))
}
