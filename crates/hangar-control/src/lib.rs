// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Control - fleet control plane for game-server workloads
//!
//! Keeps the record of truth for nodes, workloads, port allocations and user
//! entitlements, and drives each workload to its intended state on the right
//! node through the agent SDK.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              Product API / hangar-ctl                    │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  hangar-control                          │
//! │  NodeService   Orchestrator   PortAllocator   Ledger     │
//! └──────────────────────────────────────────────────────────┘
//!        │                 │                        │
//!        │ agent SDK       │ ConnectionRegistry     │ sqlx
//!        ▼                 ▼                        ▼
//! ┌──────────────┐  ┌──────────────┐      ┌──────────────────┐
//! │  NodeProbe   │  │ node daemons │      │ PostgreSQL or    │
//! │ (unregistered│  │  (QUIC+mTLS) │      │ SQLite           │
//! │   nodes)     │  └──────────────┘      └──────────────────┘
//! └──────────────┘
//! ```
//!
//! # Workload states
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `installing` | Persisted, provisioning pending or in flight |
//! | `running` | Last create, start or restart succeeded |
//! | `offline` | Provisioning failed, or last stop succeeded |
//! | `suspended` | Administrative hold |
//! | `starting` / `stopping` | Read back from storage only |

pub mod allocation;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod migrations;
pub mod nodes;
pub mod persistence;
pub mod runtime;
pub mod status;

pub use allocation::{PortAllocator, PortRange};
pub use config::{Config, ConfigError};
pub use error::{ControlError, Result};
pub use ledger::Ledger;
pub use lifecycle::{CreateWorkload, CreatedWorkload, Orchestrator};
pub use nodes::{NodeService, RegisterNode};
pub use runtime::{ControlPlane, ControlPlaneBuilder};
pub use status::{Operation, WorkloadStatus};
