// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process daemon double for testing.
//!
//! `MockDaemon` answers agent requests the way a real daemon would, without
//! running containers. `MockDialer` hands out channels to registered daemons
//! and refuses every other address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hangar_protocol::agent_proto::{
    self, AgentRequest, AgentResponse, INVALID_REQUEST, UNAUTHENTICATED, agent_request::Request,
    agent_response::Response,
};

use crate::error::{AgentError, Result};
use crate::transport::{Dialer, RpcChannel};
use crate::types::NodeStats;

/// Simulated node daemon.
pub struct MockDaemon {
    token: String,
    succeed: AtomicBool,
    hang: AtomicBool,
    stats_fail: AtomicBool,
    create_delay_ms: AtomicU64,
    stats: NodeStats,
    logs: String,
    requests: Mutex<Vec<Request>>,
}

impl MockDaemon {
    /// A daemon that accepts `token` and reports success for every call.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            succeed: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            stats_fail: AtomicBool::new(false),
            create_delay_ms: AtomicU64::new(0),
            stats: NodeStats {
                total_memory_bytes: 16 * 1024 * 1024 * 1024,
                available_memory_bytes: 12 * 1024 * 1024 * 1024,
                total_disk_bytes: 200 * 1024 * 1024 * 1024,
                available_disk_bytes: 150 * 1024 * 1024 * 1024,
                cpu_usage_percent: 12.5,
                running_containers: 0,
                uptime_seconds: 3600,
            },
            logs: "[Server thread/INFO]: Starting server\n[Server thread/INFO]: Done!\n"
                .to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every lifecycle call answers `success = false`.
    pub fn failing(self) -> Self {
        self.succeed.store(false, Ordering::SeqCst);
        self
    }

    /// Accept requests but never answer; callers hit their deadline.
    pub fn hanging(self) -> Self {
        self.hang.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_stats(mut self, stats: NodeStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_stats_fail(&self, fail: bool) {
        self.stats_fail.store(fail, Ordering::SeqCst);
    }

    /// Answer create calls only after `delay`, as when an image is still
    /// being pulled. A delay past the caller's deadline behaves like a hang.
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn create_delay(&self) -> Duration {
        Duration::from_millis(self.create_delay_ms.load(Ordering::SeqCst))
    }

    pub fn is_hanging(&self) -> bool {
        self.hang.load(Ordering::SeqCst)
    }

    /// Every authenticated request received, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.requests().iter().map(|r| r.name()).collect()
    }

    /// The most recent create request, if any.
    pub fn last_create(&self) -> Option<agent_proto::CreateWorkloadRequest> {
        self.requests().into_iter().rev().find_map(|r| match r {
            Request::CreateWorkload(create) => Some(create),
            _ => None,
        })
    }

    /// Answer one request as a daemon would.
    pub fn handle(&self, request: AgentRequest) -> AgentResponse {
        if request.token != self.token {
            return AgentResponse::error(UNAUTHENTICATED, "daemon token mismatch");
        }
        let Some(operation) = request.request else {
            return AgentResponse::error(INVALID_REQUEST, "empty request");
        };

        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation.clone());

        let succeed = self.succeed.load(Ordering::SeqCst);
        let failure = (!succeed).then(|| "simulated daemon failure".to_string());

        let response = match operation {
            Request::Ping(_) => Response::Ping(agent_proto::PingResponse {
                version: "mock".to_string(),
            }),
            Request::GetNodeStats(_) => {
                if self.stats_fail.load(Ordering::SeqCst) {
                    return AgentResponse::error("INTERNAL", "stats unavailable");
                }
                Response::NodeStats((&self.stats).into())
            }
            Request::CreateWorkload(create) => {
                Response::CreateWorkload(agent_proto::CreateWorkloadResponse {
                    success: succeed,
                    container_id: succeed.then(|| format!("ctr-{}", create.workload_id)),
                    error_message: failure,
                })
            }
            Request::StartWorkload(_)
            | Request::StopWorkload(_)
            | Request::RestartWorkload(_)
            | Request::DeleteWorkload(_) => Response::Action(agent_proto::ActionResponse {
                success: succeed,
                error_message: failure,
            }),
            Request::SendCommand(cmd) => Response::Command(agent_proto::CommandResponse {
                success: succeed,
                output: format!("executed: {}", cmd.command),
            }),
            Request::GetLogs(_) => Response::Logs(agent_proto::LogsResponse {
                success: succeed,
                text: self.logs.clone(),
            }),
        };

        AgentResponse {
            response: Some(response),
        }
    }
}

struct MockChannel {
    daemon: Arc<MockDaemon>,
    open: AtomicBool,
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse> {
        if !self.is_open() {
            return Err(AgentError::Transport("connection closed".to_string()));
        }
        let operation = request.request.as_ref().map(|r| r.name()).unwrap_or("empty");
        let delay = match &request.request {
            Some(Request::CreateWorkload(_)) => self.daemon.create_delay(),
            _ => Duration::ZERO,
        };
        if self.daemon.is_hanging() || delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(AgentError::Timeout {
                operation: operation.to_string(),
                after_ms: timeout.as_millis() as u64,
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.daemon.handle(request))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Dialer that connects only to registered mock daemons.
#[derive(Default)]
pub struct MockDialer {
    daemons: Mutex<HashMap<String, Arc<MockDaemon>>>,
    dials: AtomicUsize,
    dial_delay: Option<Duration>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every dial, widening the window for racing callers.
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = Some(delay);
        self
    }

    pub fn add_daemon(&self, address: impl Into<String>, daemon: MockDaemon) -> Arc<MockDaemon> {
        let daemon = Arc::new(daemon);
        self.daemons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.into(), daemon.clone());
        daemon
    }

    /// Make `address` unreachable for future dials.
    pub fn remove_daemon(&self, address: &str) {
        self.daemons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    /// Number of dial attempts, successful or not.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn RpcChannel>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }

        let daemon = self
            .daemons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned();

        match daemon {
            Some(daemon) => Ok(Arc::new(MockChannel {
                daemon,
                open: AtomicBool::new(true),
            })),
            None => Err(AgentError::Dial {
                address: address.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_protocol::agent_proto::PingRequest;

    fn ping(token: &str) -> AgentRequest {
        AgentRequest {
            token: token.to_string(),
            request: Some(Request::Ping(PingRequest {})),
        }
    }

    #[test]
    fn test_token_mismatch_is_not_recorded() {
        let daemon = MockDaemon::new("right");
        let response = daemon.handle(ping("wrong"));
        assert!(matches!(
            response.response,
            Some(Response::Error(ref e)) if e.code == UNAUTHENTICATED
        ));
        assert!(daemon.requests().is_empty());
    }

    #[test]
    fn test_failing_daemon_reports_reason() {
        let daemon = MockDaemon::new("t").failing();
        let response = daemon.handle(AgentRequest {
            token: "t".to_string(),
            request: Some(Request::StartWorkload(agent_proto::WorkloadRef {
                workload_id: "w".to_string(),
            })),
        });
        match response.response {
            Some(Response::Action(a)) => {
                assert!(!a.success);
                assert!(a.error_message.is_some());
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(daemon.call_names(), vec!["start_workload"]);
    }

    #[tokio::test]
    async fn test_hanging_daemon_times_out() {
        let dialer = MockDialer::new();
        dialer.add_daemon("n:1", MockDaemon::new("t").hanging());
        let channel = dialer.dial("n:1").await.unwrap();

        let result = channel.call(ping("t"), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(AgentError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_calls() {
        let dialer = MockDialer::new();
        dialer.add_daemon("n:1", MockDaemon::new("t"));
        let channel = dialer.dial("n:1").await.unwrap();
        channel.close();

        let result = channel.call(ping("t"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }
}
