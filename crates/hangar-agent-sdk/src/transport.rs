// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport seam between typed clients and the wire.
//!
//! `Dialer` establishes connections and `RpcChannel` carries calls over one.
//! Production uses QUIC through `hangar-protocol`; tests plug in
//! [`crate::mock::MockDialer`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hangar_protocol::agent_proto::{AgentRequest, AgentResponse};
use hangar_protocol::{NodeClient, NodeConnection};
use tracing::{debug, instrument};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// An established, secured connection to one daemon.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Issue one call and wait at most `timeout` for the answer.
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Opens connections to daemon addresses (`host:port`).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<Arc<dyn RpcChannel>>;
}

/// Dials daemons over QUIC with the configured TLS mode.
pub struct QuicDialer {
    client: NodeClient,
    dial_timeout: Duration,
}

impl QuicDialer {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = NodeClient::new(&config.client_config()?)
            .map_err(|e| AgentError::Config(e.to_string()))?;
        Ok(Self {
            client,
            dial_timeout: config.dial_timeout,
        })
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    #[instrument(skip(self))]
    async fn dial(&self, address: &str) -> Result<Arc<dyn RpcChannel>> {
        let dial_error = |message: String| AgentError::Dial {
            address: address.to_string(),
            message,
        };

        let server_name = server_name(address).ok_or_else(|| dial_error("missing port".into()))?;
        let addr = resolve(address).await.map_err(dial_error)?;

        let connection = self
            .client
            .connect(addr, server_name, self.dial_timeout)
            .await
            .map_err(|e| dial_error(e.to_string()))?;

        debug!(%addr, "dialed node daemon");
        Ok(Arc::new(QuicChannel { connection }))
    }
}

async fn resolve(address: &str) -> std::result::Result<SocketAddr, String> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| "address resolved to nothing".to_string())
}

/// Host part of `host:port`, used as the TLS server name.
fn server_name(address: &str) -> Option<&str> {
    let (host, port) = address.rsplit_once(':')?;
    if port.is_empty() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}

struct QuicChannel {
    connection: NodeConnection,
}

#[async_trait]
impl RpcChannel for QuicChannel {
    async fn call(&self, request: AgentRequest, timeout: Duration) -> Result<AgentResponse> {
        let operation = request
            .request
            .as_ref()
            .map(|r| r.name())
            .unwrap_or("empty");

        tokio::time::timeout(timeout, self.connection.request(&request))
            .await
            .map_err(|_| AgentError::Timeout {
                operation: operation.to_string(),
                after_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| AgentError::from_client(operation, e))
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    fn close(&self) {
        self.connection.close();
    }
}
