// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between the control plane and node daemons.
//!
//! Every call is one `AgentRequest` envelope carrying the bearer token and
//! exactly one operation, answered by one `AgentResponse`.

/// Error code a daemon returns when the bearer token does not match.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";

/// Error code for an envelope without an operation.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentRequest {
    /// Node daemon token, checked by the daemon on every call.
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(oneof = "agent_request::Request", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10")]
    pub request: Option<agent_request::Request>,
}

pub mod agent_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "2")]
        Ping(super::PingRequest),
        #[prost(message, tag = "3")]
        GetNodeStats(super::GetNodeStatsRequest),
        #[prost(message, tag = "4")]
        CreateWorkload(super::CreateWorkloadRequest),
        #[prost(message, tag = "5")]
        StartWorkload(super::WorkloadRef),
        #[prost(message, tag = "6")]
        StopWorkload(super::StopWorkloadRequest),
        #[prost(message, tag = "7")]
        RestartWorkload(super::WorkloadRef),
        #[prost(message, tag = "8")]
        DeleteWorkload(super::WorkloadRef),
        #[prost(message, tag = "9")]
        SendCommand(super::SendCommandRequest),
        #[prost(message, tag = "10")]
        GetLogs(super::GetLogsRequest),
    }

    impl Request {
        /// Operation name used in logs and call records.
        pub fn name(&self) -> &'static str {
            match self {
                Request::Ping(_) => "ping",
                Request::GetNodeStats(_) => "get_node_stats",
                Request::CreateWorkload(_) => "create_workload",
                Request::StartWorkload(_) => "start_workload",
                Request::StopWorkload(_) => "stop_workload",
                Request::RestartWorkload(_) => "restart_workload",
                Request::DeleteWorkload(_) => "delete_workload",
                Request::SendCommand(_) => "send_command",
                Request::GetLogs(_) => "get_logs",
            }
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentResponse {
    #[prost(oneof = "agent_response::Response", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub response: Option<agent_response::Response>,
}

pub mod agent_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Ping(super::PingResponse),
        #[prost(message, tag = "2")]
        NodeStats(super::NodeStatsResponse),
        #[prost(message, tag = "3")]
        CreateWorkload(super::CreateWorkloadResponse),
        #[prost(message, tag = "4")]
        Action(super::ActionResponse),
        #[prost(message, tag = "5")]
        Command(super::CommandResponse),
        #[prost(message, tag = "6")]
        Logs(super::LogsResponse),
        #[prost(message, tag = "7")]
        Error(super::RpcError),
    }
}

impl AgentResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response: Some(agent_response::Response::Error(RpcError {
                code: code.into(),
                message: message.into(),
            })),
        }
    }

    pub fn action(success: bool, error_message: Option<String>) -> Self {
        Self {
            response: Some(agent_response::Response::Action(ActionResponse {
                success,
                error_message,
            })),
        }
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    /// Daemon version string.
    #[prost(string, tag = "1")]
    pub version: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GetNodeStatsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStatsResponse {
    #[prost(uint64, tag = "1")]
    pub total_memory_bytes: u64,
    #[prost(uint64, tag = "2")]
    pub available_memory_bytes: u64,
    #[prost(uint64, tag = "3")]
    pub total_disk_bytes: u64,
    #[prost(uint64, tag = "4")]
    pub available_disk_bytes: u64,
    #[prost(double, tag = "5")]
    pub cpu_usage_percent: f64,
    #[prost(uint32, tag = "6")]
    pub running_containers: u32,
    #[prost(uint64, tag = "7")]
    pub uptime_seconds: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResourceLimits {
    #[prost(uint64, tag = "1")]
    pub memory_mb: u64,
    #[prost(uint64, tag = "2")]
    pub disk_mb: u64,
    /// 100 equals one full core.
    #[prost(uint32, tag = "3")]
    pub cpu_percent: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PortAllocation {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(bool, tag = "2")]
    pub is_primary: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvVar {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateWorkloadRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub image: String,
    #[prost(message, optional, tag = "4")]
    pub limits: Option<ResourceLimits>,
    #[prost(message, repeated, tag = "5")]
    pub allocations: Vec<PortAllocation>,
    #[prost(message, repeated, tag = "6")]
    pub env: Vec<EnvVar>,
    #[prost(string, tag = "7")]
    pub data_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub container_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub error_message: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkloadRef {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopWorkloadRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    /// Grace period before the daemon kills the container.
    #[prost(uint32, tag = "2")]
    pub timeout_seconds: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub error_message: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendCommandRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    #[prost(string, tag = "2")]
    pub command: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub output: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLogsRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogsResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Newline-delimited recent output.
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_envelope_keeps_token_and_operation() {
        let request = AgentRequest {
            token: "secret".to_string(),
            request: Some(agent_request::Request::StopWorkload(StopWorkloadRequest {
                workload_id: "w-1".to_string(),
                timeout_seconds: 30,
            })),
        };

        let decoded = AgentRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.token, "secret");
        match decoded.request {
            Some(agent_request::Request::StopWorkload(stop)) => {
                assert_eq!(stop.workload_id, "w-1");
                assert_eq!(stop.timeout_seconds, 30);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_stay_absent() {
        let response = CreateWorkloadResponse {
            success: false,
            container_id: None,
            error_message: Some("image pull failed".to_string()),
        };
        let decoded =
            CreateWorkloadResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.container_id.is_none());
        assert_eq!(decoded.error_message.as_deref(), Some("image pull failed"));
    }

    #[test]
    fn test_request_names() {
        assert_eq!(agent_request::Request::Ping(PingRequest {}).name(), "ping");
        assert_eq!(
            agent_request::Request::GetLogs(GetLogsRequest {
                workload_id: "w".to_string()
            })
            .name(),
            "get_logs"
        );
    }

    #[test]
    fn test_error_response_helper() {
        let response = AgentResponse::error(UNAUTHENTICATED, "bad token");
        match response.response {
            Some(agent_response::Response::Error(e)) => {
                assert_eq!(e.code, UNAUTHENTICATED);
                assert_eq!(e.message, "bad token");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
