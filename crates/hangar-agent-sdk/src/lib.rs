// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Agent SDK
//!
//! Talks to the daemons running on fleet nodes.
//!
//! - [`ConnectionRegistry`]: one cached connection per node address
//! - [`AgentClient`]: typed RPCs carrying the node's bearer token
//! - [`NodeProbe`]: reachability and capability check for unregistered nodes
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hangar_agent_sdk::{AgentClient, AgentConfig, ConnectionRegistry, QuicDialer};
//!
//! let config = AgentConfig::new().with_tls("client.pem", "client.key", "ca.pem");
//! let registry = ConnectionRegistry::new(Arc::new(QuicDialer::new(&config)?));
//!
//! let channel = registry.get("node-1.example.com:8443").await?;
//! let client = AgentClient::new(channel, daemon_token).with_timeouts(config.timeouts);
//! let stats = client.node_stats().await?;
//! ```

mod client;
mod config;
mod error;
pub mod mock;
mod probe;
mod registry;
pub mod transport;
mod types;

pub use client::AgentClient;
pub use config::{AgentConfig, CallTimeouts};
pub use error::{AgentError, Result};
pub use probe::{NodeProbe, ProbeReport, ProbeStatus};
pub use registry::ConnectionRegistry;
pub use transport::{Dialer, QuicDialer, RpcChannel};
pub use types::{CommandOutput, LogSnapshot, NodeStats, PortBinding, RpcOutcome, WorkloadSpec};
