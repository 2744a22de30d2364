// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource entitlement ledger.
//!
//! Each user has two balances. Purchased currency lands in `earned`, every
//! other credit lands in `granted`. Spends draw from `earned` first, and
//! neither balance ever goes negative. Each movement leaves an immutable
//! ledger entry.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{ControlError, Result};
use crate::persistence::{
    BalanceKind, LedgerEntryRecord, Persistence, PoolDelta, ResourcePoolRecord, ResourceUsage,
};

/// Grant source that credits the earned balance.
pub const PURCHASE_SOURCE: &str = "purchase";

/// Grant source used when a failed purchase is refunded.
pub const REFUND_SOURCE: &str = "refund";

/// Split a debit of `amount` into `(from_earned, from_granted)`.
pub(crate) fn split_debit(earned: i64, granted: i64, amount: i64) -> Result<(i64, i64)> {
    let available = earned + granted;
    if amount > available {
        return Err(ControlError::InsufficientBalance {
            requested: amount,
            available,
        });
    }
    let from_earned = amount.min(earned);
    Ok((from_earned, amount - from_earned))
}

fn require_positive(field: &str, amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(ControlError::validation(field, "must be greater than zero"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct Ledger {
    persistence: Arc<dyn Persistence>,
}

impl Ledger {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Credit `amount`. A `purchase` source credits earned, anything else granted.
    #[instrument(skip(self, description))]
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<ResourcePoolRecord> {
        require_positive("amount", amount)?;
        if source.trim().is_empty() {
            return Err(ControlError::validation("source", "must not be empty"));
        }

        let balance = if source == PURCHASE_SOURCE {
            BalanceKind::Earned
        } else {
            BalanceKind::Granted
        };
        let pool = self
            .persistence
            .grant(user_id, amount, balance, source, description)
            .await?;

        info!(
            balance = balance.as_str(),
            total = pool.total_balance(),
            "balance credited"
        );
        Ok(pool)
    }

    /// Debit `amount`, earned first. Fails without side effects when the
    /// combined balance is short.
    #[instrument(skip(self, description))]
    pub async fn spend(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<ResourcePoolRecord> {
        require_positive("amount", amount)?;
        let pool = self.persistence.spend(user_id, amount, description).await?;
        info!(total = pool.total_balance(), "balance debited");
        Ok(pool)
    }

    #[instrument(skip(self))]
    pub async fn add_resource_pool(
        &self,
        user_id: &str,
        delta: PoolDelta,
    ) -> Result<ResourcePoolRecord> {
        validate_delta(&delta)?;
        self.persistence.add_resource_pool(user_id, delta).await
    }

    /// Debit `cost` and raise the pool by `delta` atomically.
    #[instrument(skip(self, description))]
    pub async fn purchase_resources(
        &self,
        user_id: &str,
        cost: i64,
        delta: PoolDelta,
        description: &str,
    ) -> Result<ResourcePoolRecord> {
        require_positive("cost", cost)?;
        validate_delta(&delta)?;
        self.persistence
            .purchase_resources(user_id, cost, delta, description)
            .await
    }

    /// Debit, then raise the pool as a separate step. If the raise fails the
    /// debit is refunded with a compensating `refund` grant.
    ///
    /// For stores that cannot span both writes in one transaction.
    #[instrument(skip(self, description))]
    pub async fn purchase_resources_compensated(
        &self,
        user_id: &str,
        cost: i64,
        delta: PoolDelta,
        description: &str,
    ) -> Result<ResourcePoolRecord> {
        require_positive("cost", cost)?;
        validate_delta(&delta)?;

        self.spend(user_id, cost, description).await?;
        match self.persistence.add_resource_pool(user_id, delta).await {
            Ok(pool) => Ok(pool),
            Err(e) => {
                warn!(error = %e, "pool increase failed, refunding");
                let refund = format!("refund: {}", description);
                if let Err(refund_err) = self.grant(user_id, cost, REFUND_SOURCE, &refund).await {
                    warn!(error = %refund_err, "refund failed");
                }
                Err(e)
            }
        }
    }

    pub async fn balance(&self, user_id: &str) -> Result<ResourcePoolRecord> {
        self.persistence
            .get_resource_pool(user_id)
            .await?
            .ok_or_else(|| ControlError::UserNotFound(user_id.to_string()))
    }

    /// Sum of the user's workload limits.
    pub async fn usage(&self, user_id: &str) -> Result<ResourceUsage> {
        self.persistence.resource_usage(user_id).await
    }

    pub async fn entries(&self, user_id: &str, limit: i64) -> Result<Vec<LedgerEntryRecord>> {
        self.persistence.list_ledger_entries(user_id, limit).await
    }

    /// Whether a workload with these limits fits in the user's remaining pool.
    pub async fn check_capacity(
        &self,
        user_id: &str,
        ram_mb: i64,
        cpu_percent: i64,
        disk_mb: i64,
    ) -> Result<()> {
        let pool = self.balance(user_id).await?;
        let usage = self.usage(user_id).await?;
        crate::persistence::check_pool(&pool, &usage, ram_mb, cpu_percent, disk_mb)
    }
}

fn validate_delta(delta: &PoolDelta) -> Result<()> {
    if delta.ram_mb < 0 || delta.cpu_cores < 0 || delta.storage_mb < 0 {
        return Err(ControlError::validation("pool", "increments must not be negative"));
    }
    if *delta == PoolDelta::default() {
        return Err(ControlError::validation("pool", "nothing to add"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_prefers_earned() {
        assert_eq!(split_debit(30, 100, 20).unwrap(), (20, 0));
        assert_eq!(split_debit(30, 100, 50).unwrap(), (30, 20));
        assert_eq!(split_debit(0, 100, 100).unwrap(), (0, 100));
    }

    #[test]
    fn test_split_rejects_overdraft() {
        match split_debit(10, 5, 16) {
            Err(ControlError::InsufficientBalance {
                requested,
                available,
            }) => {
                assert_eq!(requested, 16);
                assert_eq!(available, 15);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_delta_validation() {
        assert!(validate_delta(&PoolDelta::default()).is_err());
        assert!(
            validate_delta(&PoolDelta {
                ram_mb: -1,
                cpu_cores: 1,
                storage_mb: 0
            })
            .is_err()
        );
        assert!(
            validate_delta(&PoolDelta {
                ram_mb: 1024,
                cpu_cores: 0,
                storage_mb: 0
            })
            .is_ok()
        );
    }
}
