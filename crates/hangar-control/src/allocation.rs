// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port allocation.
//!
//! Assignment runs inside one database transaction that serializes on the node
//! row, scans the range in ascending order and binds the first free port as
//! the workload's primary allocation. Two workloads on one node can never
//! receive the same port.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ControlError, Result};
use crate::persistence::{AllocationRecord, Persistence};

/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// `None` when `start` is 0 or `start > end`.
    pub fn new(start: u16, end: u16) -> Option<Self> {
        (start > 0 && start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Candidates in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 25565,
            end: 25600,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ControlError::validation("port_range", format!("invalid range '{}'", s));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        PortRange::new(start, end).ok_or_else(invalid)
    }
}

#[derive(Clone)]
pub struct PortAllocator {
    persistence: Arc<dyn Persistence>,
    range: PortRange,
}

impl PortAllocator {
    pub fn new(persistence: Arc<dyn Persistence>, range: PortRange) -> Self {
        Self { persistence, range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Same store, different candidate range.
    pub fn with_range(&self, range: PortRange) -> Self {
        Self {
            persistence: self.persistence.clone(),
            range,
        }
    }

    /// Reserve the lowest free port on `node_id` for `workload_id`.
    #[instrument(skip(self), fields(range = %self.range))]
    pub async fn assign(&self, workload_id: &str, node_id: &str) -> Result<AllocationRecord> {
        match self
            .persistence
            .assign_port(workload_id, node_id, &self.range)
            .await
        {
            Ok(allocation) => {
                info!(port = allocation.port, allocation_id = %allocation.id, "port assigned");
                Ok(allocation)
            }
            Err(e) => {
                warn!(error = %e, "port assignment failed");
                Err(e)
            }
        }
    }
}
