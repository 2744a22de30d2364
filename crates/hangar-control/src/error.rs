// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-control.

use thiserror::Error;

use crate::status::{Operation, WorkloadStatus};

pub type Result<T> = std::result::Result<T, ControlError>;

/// Control-plane errors. Every variant carries a stable code for API layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// Request validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("Workload '{0}' not found")]
    WorkloadNotFound(String),

    #[error("User '{0}' not found")]
    UserNotFound(String),

    /// New placements are suppressed on nodes under maintenance.
    #[error("Node '{0}' is in maintenance")]
    NodeInMaintenance(String),

    /// Nodes can only be deleted once no workload references them.
    #[error("Node '{node_id}' still hosts {workloads} workload(s)")]
    NodeInUse { node_id: String, workloads: i64 },

    /// The node refused registration during its probe.
    #[error("Node at '{address}' failed its probe ({status}): {message}")]
    ProbeFailed {
        address: String,
        status: String,
        message: String,
    },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Resource pool exhausted: {resource} needs {requested}, {available} available")]
    ResourcePoolExhausted {
        resource: &'static str,
        requested: i64,
        available: i64,
    },

    #[error("No free port on node '{node_id}' in range {range}")]
    PortRangeExhausted { node_id: String, range: String },

    #[error("Cannot {operation} workload '{workload_id}' while it is {status}")]
    InvalidTransition {
        workload_id: String,
        status: WorkloadStatus,
        operation: Operation,
    },

    /// The daemon answered `success = false`.
    #[error("Node rejected {operation}: {message}")]
    Remote { operation: String, message: String },

    /// The daemon could not be reached, timed out or refused the credential.
    #[error("Agent error: {0}")]
    Agent(#[from] hangar_agent_sdk::AgentError),

    #[error("Database error during '{operation}': {details}")]
    Database { operation: String, details: String },

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ControlError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ControlError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::WorkloadNotFound(_) => "WORKLOAD_NOT_FOUND",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::NodeInMaintenance(_) => "NODE_IN_MAINTENANCE",
            Self::NodeInUse { .. } => "NODE_IN_USE",
            Self::ProbeFailed { .. } => "PROBE_FAILED",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::ResourcePoolExhausted { .. } => "RESOURCE_POOL_EXHAUSTED",
            Self::PortRangeExhausted { .. } => "PORT_RANGE_EXHAUSTED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Remote { .. } => "REMOTE_FAILURE",
            Self::Agent(e) if e.is_connectivity() => "NODE_UNREACHABLE",
            Self::Agent(hangar_agent_sdk::AgentError::Unauthenticated(_)) => "NODE_UNAUTHORIZED",
            Self::Agent(_) => "AGENT_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Rejected before any side effect; retrying the same request cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::NodeNotFound(_)
                | Self::WorkloadNotFound(_)
                | Self::UserNotFound(_)
                | Self::NodeInMaintenance(_)
                | Self::NodeInUse { .. }
                | Self::InsufficientBalance { .. }
                | Self::ResourcePoolExhausted { .. }
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(err: sqlx::Error) -> Self {
        ControlError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
