// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon side of the agent protocol.
//!
//! The node daemon itself is a separate program; this server exists so that a
//! daemon (or a test double) can speak the exact wire format the control plane
//! expects.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::agent_proto::{AgentRequest, AgentResponse, INVALID_REQUEST, RpcError};
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::tls::{TlsError, load_certs, load_private_key, root_store};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<TlsError> for ServerError {
    fn from(err: TlsError) -> Self {
        ServerError::Tls(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AgentServerConfig {
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// CA used to verify control-plane client certificates. `None` accepts
    /// unauthenticated clients.
    pub client_ca_pem: Option<Vec<u8>>,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            client_ca_pem: None,
            max_bi_streams: 256,
            idle_timeout_ms: 900_000,
        }
    }
}

pub struct AgentServer {
    endpoint: Endpoint,
}

impl AgentServer {
    pub fn new(config: AgentServerConfig) -> Result<Self, ServerError> {
        let server_config = Self::build_server_config(&config)?;
        let endpoint = Endpoint::server(server_config, config.bind_addr)?;

        info!(
            addr = %config.bind_addr,
            client_auth = config.client_ca_pem.is_some(),
            "agent server bound"
        );

        Ok(Self { endpoint })
    }

    /// Bind with a self-signed `localhost` certificate and no client auth.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        Self::new(AgentServerConfig {
            bind_addr,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        })
    }

    fn build_server_config(config: &AgentServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = load_certs(&config.cert_pem)?;
        let key = load_private_key(&config.key_pem)?;

        let builder = rustls::ServerConfig::builder();
        let crypto = match &config.client_ca_pem {
            Some(ca_pem) => {
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(ca_pem)?))
                        .build()
                        .map_err(|e| ServerError::Tls(e.to_string()))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?,
        ));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));

        Ok(server_config)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections until the endpoint closes, answering each request
    /// stream with `handler`.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(AgentRequest) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = AgentResponse> + Send + 'static,
    {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        debug!(remote = %connection.remote_address(), "accepted connection");
                        serve_connection(connection, handler).await;
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            });
        }
        Ok(())
    }
}

async fn serve_connection<H, Fut>(connection: quinn::Connection, handler: H)
where
    H: Fn(AgentRequest) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = AgentResponse> + Send + 'static,
{
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(send, recv, handler).await {
                        warn!(error = %e, "request stream failed");
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!("connection closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "error accepting stream");
                break;
            }
        }
    }
}

async fn serve_stream<H, Fut>(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: H,
) -> Result<(), ServerError>
where
    H: Fn(AgentRequest) -> Fut,
    Fut: Future<Output = AgentResponse>,
{
    let frame = read_frame(&mut recv).await?;

    let reply = match (frame.message_type, frame.decode::<AgentRequest>()) {
        (MessageType::Request, Ok(request)) => Frame::response(&handler(request).await)?,
        (MessageType::Request, Err(e)) => Frame::error(&RpcError {
            code: INVALID_REQUEST.to_string(),
            message: e.to_string(),
        })?,
        (other, _) => Frame::error(&RpcError {
            code: INVALID_REQUEST.to_string(),
            message: format!("expected request frame, got {:?}", other),
        })?,
    };

    write_frame(&mut send, &reply).await?;
    send.finish()
        .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))?;
    Ok(())
}
