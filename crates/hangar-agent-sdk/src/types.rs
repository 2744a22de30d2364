// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed views over agent protocol messages.

use std::collections::BTreeMap;

use hangar_protocol::agent_proto;
use serde::{Deserialize, Serialize};

/// Host capacity snapshot reported by a daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub available_disk_bytes: u64,
    pub cpu_usage_percent: f64,
    pub running_containers: u32,
    pub uptime_seconds: u64,
}

impl NodeStats {
    pub fn total_memory_mb(&self) -> u64 {
        self.total_memory_bytes / (1024 * 1024)
    }

    pub fn total_disk_mb(&self) -> u64 {
        self.total_disk_bytes / (1024 * 1024)
    }
}

impl From<agent_proto::NodeStatsResponse> for NodeStats {
    fn from(r: agent_proto::NodeStatsResponse) -> Self {
        Self {
            total_memory_bytes: r.total_memory_bytes,
            available_memory_bytes: r.available_memory_bytes,
            total_disk_bytes: r.total_disk_bytes,
            available_disk_bytes: r.available_disk_bytes,
            cpu_usage_percent: r.cpu_usage_percent,
            running_containers: r.running_containers,
            uptime_seconds: r.uptime_seconds,
        }
    }
}

impl From<&NodeStats> for agent_proto::NodeStatsResponse {
    fn from(s: &NodeStats) -> Self {
        Self {
            total_memory_bytes: s.total_memory_bytes,
            available_memory_bytes: s.available_memory_bytes,
            total_disk_bytes: s.total_disk_bytes,
            available_disk_bytes: s.available_disk_bytes,
            cpu_usage_percent: s.cpu_usage_percent,
            running_containers: s.running_containers,
            uptime_seconds: s.uptime_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub is_primary: bool,
}

/// Everything a daemon needs to provision one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: String,
    pub name: String,
    pub image: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpu_percent: u32,
    pub ports: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
    pub data_directory: String,
}

impl From<&WorkloadSpec> for agent_proto::CreateWorkloadRequest {
    fn from(spec: &WorkloadSpec) -> Self {
        Self {
            workload_id: spec.id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            limits: Some(agent_proto::ResourceLimits {
                memory_mb: spec.memory_mb,
                disk_mb: spec.disk_mb,
                cpu_percent: spec.cpu_percent,
            }),
            allocations: spec
                .ports
                .iter()
                .map(|p| agent_proto::PortAllocation {
                    port: u32::from(p.port),
                    is_primary: p.is_primary,
                })
                .collect(),
            env: spec
                .env
                .iter()
                .map(|(key, value)| agent_proto::EnvVar {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            data_directory: spec.data_directory.clone(),
        }
    }
}

/// A daemon's answer to a lifecycle call: the success flag and, on failure,
/// its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOutcome {
    pub success: bool,
    /// Set by create on success.
    pub container_id: Option<String>,
    pub message: Option<String>,
}

impl RpcOutcome {
    pub fn failure_reason(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "daemon reported failure without a reason".to_string())
    }
}

impl From<agent_proto::ActionResponse> for RpcOutcome {
    fn from(r: agent_proto::ActionResponse) -> Self {
        Self {
            success: r.success,
            container_id: None,
            message: r.error_message,
        }
    }
}

impl From<agent_proto::CreateWorkloadResponse> for RpcOutcome {
    fn from(r: agent_proto::CreateWorkloadResponse) -> Self {
        Self {
            success: r.success,
            container_id: r.container_id,
            message: r.error_message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

/// Point-in-time log tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub success: bool,
    pub text: String,
}

impl LogSnapshot {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}
