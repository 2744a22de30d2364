// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hangar-agent-sdk.

use hangar_protocol::{ClientError, FrameError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while talking to a node daemon.
///
/// A daemon answering `success = false` is not an error at this level; it is
/// reported through [`crate::RpcOutcome`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection could not be established.
    #[error("failed to dial {address}: {message}")]
    Dial { address: String, message: String },

    /// No answer within the call deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The connection broke mid-call.
    #[error("transport error: {0}")]
    Transport(String),

    /// The daemon rejected the bearer credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The daemon refused the call with a protocol-level error.
    #[error("daemon error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// The daemon answered with the wrong response kind.
    #[error("unexpected response to {operation}: {detail}")]
    UnexpectedResponse { operation: String, detail: String },
}

impl AgentError {
    /// Dial failures and timeouts: the node could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AgentError::Dial { .. } | AgentError::Timeout { .. } | AgentError::Transport(_)
        )
    }

    /// Classify a wire-level failure of `operation`. Only failures of the
    /// connection itself become `Transport`; a reply that arrived but could
    /// not be understood leaves the connection usable.
    pub(crate) fn from_client(operation: &str, err: ClientError) -> Self {
        match err {
            ClientError::Rejected { code, message }
                if code == hangar_protocol::agent_proto::UNAUTHENTICATED =>
            {
                AgentError::Unauthenticated(message)
            }
            ClientError::Rejected { code, message } => AgentError::Remote { code, message },
            err @ (ClientError::Frame(
                FrameError::Decode(_)
                | FrameError::UnknownMessageType(_)
                | FrameError::PayloadTooLarge(_),
            )
            | ClientError::UnexpectedMessage(_)) => AgentError::UnexpectedResponse {
                operation: operation.to_string(),
                detail: err.to_string(),
            },
            other => AgentError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_unauthenticated_maps_to_unauthenticated() {
        let err = AgentError::from_client(
            "ping",
            ClientError::Rejected {
                code: "UNAUTHENTICATED".to_string(),
                message: "bad token".to_string(),
            },
        );
        assert!(matches!(err, AgentError::Unauthenticated(ref m) if m == "bad token"));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_transport_errors_are_connectivity() {
        let err = AgentError::from_client("ping", ClientError::Timeout(100));
        assert!(matches!(err, AgentError::Transport(_)));
        assert!(err.is_connectivity());

        let timeout = AgentError::Timeout {
            operation: "create_workload".to_string(),
            after_ms: 600_000,
        };
        assert!(timeout.is_connectivity());
        assert_eq!(timeout.to_string(), "create_workload timed out after 600000ms");
    }

    #[test]
    fn test_malformed_reply_is_not_transport() {
        let err = AgentError::from_client(
            "get_logs",
            ClientError::UnexpectedMessage(hangar_protocol::MessageType::Request),
        );
        assert!(matches!(
            err,
            AgentError::UnexpectedResponse { ref operation, .. } if operation == "get_logs"
        ));
        assert!(!err.is_connectivity());

        let err = AgentError::from_client(
            "ping",
            ClientError::Frame(FrameError::UnknownMessageType(7)),
        );
        assert!(matches!(err, AgentError::UnexpectedResponse { .. }));

        let closed = AgentError::from_client("ping", ClientError::Frame(FrameError::Closed));
        assert!(matches!(closed, AgentError::Transport(_)));
    }
}
