// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client side used by the control plane to reach node daemons.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::agent_proto::RpcError;
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::tls::{TlsError, TlsMaterial};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("peer rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),
}

/// Configuration for the node-facing QUIC endpoint.
#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    /// Client certificate, key and CA for mutual TLS.
    pub tls: Option<TlsMaterial>,
    /// Skip server verification and client authentication (development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            tls: None,
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            // Provisioning calls can hold a stream open for minutes.
            idle_timeout_ms: 900_000,
        }
    }
}

impl NodeClientConfig {
    pub fn mutual_tls(tls: TlsMaterial) -> Self {
        Self {
            tls: Some(tls),
            ..Self::default()
        }
    }

    pub fn insecure() -> Self {
        Self {
            dangerous_skip_cert_verification: true,
            ..Self::default()
        }
    }
}

/// One client endpoint shared by every outgoing node connection.
#[derive(Clone)]
pub struct NodeClient {
    endpoint: Endpoint,
}

impl NodeClient {
    pub fn new(config: &NodeClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        endpoint.set_default_client_config(Self::build_client_config(config)?);

        if config.dangerous_skip_cert_verification {
            warn!("node transport verification is DISABLED; do not use in production");
        }

        Ok(Self { endpoint })
    }

    fn build_client_config(config: &NodeClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
                .with_no_client_auth()
        } else if let Some(tls) = &config.tls {
            rustls::ClientConfig::builder()
                .with_root_certificates(tls.roots()?)
                .with_client_auth_cert(tls.certs()?, tls.private_key()?)
                .map_err(TlsError::from)?
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ClientError::Config("idle timeout out of range".to_string()))?,
        ));

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Dial a daemon, bounded by `timeout`.
    #[instrument(skip(self))]
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        timeout: Duration,
    ) -> Result<NodeConnection, ClientError> {
        let connecting = self.endpoint.connect(addr, server_name)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))??;

        debug!(%addr, "connected to node daemon");
        Ok(NodeConnection { connection })
    }
}

/// An established connection to one daemon. Cheap to clone.
#[derive(Clone)]
pub struct NodeConnection {
    connection: Connection,
}

impl NodeConnection {
    /// Send one request on a fresh stream and wait for the response.
    pub async fn request<Req: prost::Message, Resp: prost::Message + Default>(
        &self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let (mut send, mut recv) = self.connection.open_bi().await?;

        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;

        let frame = read_frame(&mut recv).await?;
        match frame.message_type {
            MessageType::Response => Ok(frame.decode()?),
            MessageType::Error => {
                let error: RpcError = frame.decode()?;
                Err(ClientError::Rejected {
                    code: error.code,
                    message: error.message,
                })
            }
            other => Err(ClientError::UnexpectedMessage(other)),
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client closing");
    }
}

/// Certificate verifier that accepts any server (development only!)
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
