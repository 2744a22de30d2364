// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload status machine.
//!
//! ```text
//! installing         ──provision ok──►  running
//! installing         ──provision err─►  offline
//! offline            ──start─────────►  running
//! running            ──stop──────────►  offline
//! running | offline  ──restart───────►  running
//! running | offline  ──suspend───────►  suspended
//! suspended          ──unsuspend─────►  offline
//! ```
//!
//! `starting` and `stopping` are understood when read back but are never
//! written by the orchestrator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Installing,
    Starting,
    Running,
    Stopping,
    Offline,
    Suspended,
}

/// A caller-requested operation on an existing workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    SendCommand,
    FetchLogs,
    Suspend,
    Unsuspend,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::SendCommand => "send a command to",
            Operation::FetchLogs => "fetch logs of",
            Operation::Suspend => "suspend",
            Operation::Unsuspend => "unsuspend",
        };
        f.write_str(s)
    }
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Installing => "installing",
            WorkloadStatus::Starting => "starting",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopping => "stopping",
            WorkloadStatus::Offline => "offline",
            WorkloadStatus::Suspended => "suspended",
        }
    }

    /// Status after `op` succeeds, or `None` if `op` is not allowed from here.
    /// Read-only operations keep the current status.
    pub fn next(self, op: Operation) -> Option<WorkloadStatus> {
        use Operation::*;
        use WorkloadStatus::*;

        match (self, op) {
            (Offline, Start) => Some(Running),
            (Running, Stop) => Some(Offline),
            (Running | Offline, Restart) => Some(Running),
            (Running, SendCommand) => Some(Running),
            (Installing | Running | Offline, FetchLogs) => Some(self),
            (Running | Offline, Suspend) => Some(Suspended),
            (Suspended, Unsuspend) => Some(Offline),
            _ => None,
        }
    }

    /// Like [`WorkloadStatus::next`], as a typed error for `workload_id`.
    pub fn apply(self, workload_id: &str, op: Operation) -> Result<WorkloadStatus, ControlError> {
        self.next(op).ok_or_else(|| ControlError::InvalidTransition {
            workload_id: workload_id.to_string(),
            status: self,
            operation: op,
        })
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(WorkloadStatus::Installing),
            "starting" => Ok(WorkloadStatus::Starting),
            "running" => Ok(WorkloadStatus::Running),
            "stopping" => Ok(WorkloadStatus::Stopping),
            "offline" => Ok(WorkloadStatus::Offline),
            "suspended" => Ok(WorkloadStatus::Suspended),
            other => Err(ControlError::validation(
                "status",
                format!("unknown workload status '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WorkloadStatus; 6] = [
        WorkloadStatus::Installing,
        WorkloadStatus::Starting,
        WorkloadStatus::Running,
        WorkloadStatus::Stopping,
        WorkloadStatus::Offline,
        WorkloadStatus::Suspended,
    ];

    #[test]
    fn test_parse_display_agree() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<WorkloadStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<WorkloadStatus>().is_err());
    }

    #[test]
    fn test_start_and_stop_conflicts() {
        assert!(WorkloadStatus::Running.next(Operation::Start).is_none());
        assert!(WorkloadStatus::Offline.next(Operation::Stop).is_none());
        assert_eq!(
            WorkloadStatus::Offline.next(Operation::Start),
            Some(WorkloadStatus::Running)
        );
        assert_eq!(
            WorkloadStatus::Running.next(Operation::Stop),
            Some(WorkloadStatus::Offline)
        );
    }

    #[test]
    fn test_restart_from_running_or_offline() {
        assert_eq!(
            WorkloadStatus::Running.next(Operation::Restart),
            Some(WorkloadStatus::Running)
        );
        assert_eq!(
            WorkloadStatus::Offline.next(Operation::Restart),
            Some(WorkloadStatus::Running)
        );
    }

    #[test]
    fn test_installing_and_suspended_refuse_control() {
        for op in [Operation::Start, Operation::Stop, Operation::Restart, Operation::SendCommand] {
            assert!(WorkloadStatus::Installing.next(op).is_none(), "{:?}", op);
            assert!(WorkloadStatus::Suspended.next(op).is_none(), "{:?}", op);
        }
    }

    #[test]
    fn test_transitional_states_refuse_everything() {
        for op in [
            Operation::Start,
            Operation::Stop,
            Operation::Restart,
            Operation::Suspend,
            Operation::Unsuspend,
        ] {
            assert!(WorkloadStatus::Starting.next(op).is_none());
            assert!(WorkloadStatus::Stopping.next(op).is_none());
        }
    }

    #[test]
    fn test_suspend_cycle() {
        let suspended = WorkloadStatus::Running.apply("w", Operation::Suspend).unwrap();
        assert_eq!(suspended, WorkloadStatus::Suspended);
        assert_eq!(
            suspended.apply("w", Operation::Unsuspend).unwrap(),
            WorkloadStatus::Offline
        );
        assert!(WorkloadStatus::Offline.apply("w", Operation::Unsuspend).is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&WorkloadStatus::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }
}
