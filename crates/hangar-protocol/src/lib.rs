// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Protocol - QUIC + Protobuf communication with node daemons
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    hangar-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: one AgentRequest / AgentResponse per stream     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn) with mutual TLS (rustls)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hangar_protocol::{NodeClient, NodeClientConfig, agent_proto};
//!
//! let client = NodeClient::new(&NodeClientConfig::insecure())?;
//! let conn = client.connect(addr, "node-1.example", Duration::from_secs(5)).await?;
//!
//! let request = agent_proto::AgentRequest {
//!     token: daemon_token,
//!     request: Some(agent_proto::agent_request::Request::Ping(agent_proto::PingRequest {})),
//! };
//! let response: agent_proto::AgentResponse = conn.request(&request).await?;
//! ```

pub mod agent_proto;
pub mod client;
pub mod frame;
pub mod server;
pub mod tls;

pub use client::{ClientError, NodeClient, NodeClientConfig, NodeConnection};
pub use frame::{Frame, FrameError, MessageType};
pub use server::{AgentServer, AgentServerConfig, ServerError};
pub use tls::{TlsError, TlsMaterial};
