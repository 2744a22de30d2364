// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cache of one long-lived connection per node address.
//!
//! Each address owns a slot that is filled by at most one dial at a time.
//! The map lock is only held to find or create a slot, never across a dial,
//! so a slow node does not hold up lookups for any other node. Failed dials
//! leave the slot empty and nothing is retried here. A connection that
//! breaks stays cached until [`ConnectionRegistry::remove`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::transport::{Dialer, RpcChannel};

type Slot = Arc<OnceCell<Arc<dyn RpcChannel>>>;

pub struct ConnectionRegistry {
    dialer: Arc<dyn Dialer>,
    connections: RwLock<HashMap<String, Slot>>,
}

impl ConnectionRegistry {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached connection for `address`, dialing on first use.
    pub async fn get(&self, address: &str) -> Result<Arc<dyn RpcChannel>> {
        let slot = self.slot(address).await;
        if let Some(channel) = slot.get() {
            return Ok(channel.clone());
        }

        let dialed = slot
            .get_or_try_init(|| async {
                let channel = self.dialer.dial(address).await?;
                info!(address, "cached new node connection");
                Ok::<_, AgentError>(channel)
            })
            .await;

        match dialed {
            Ok(channel) => Ok(channel.clone()),
            Err(e) => {
                self.discard_empty(address, &slot).await;
                Err(e)
            }
        }
    }

    async fn slot(&self, address: &str) -> Slot {
        if let Some(slot) = self.connections.read().await.get(address) {
            return slot.clone();
        }
        self.connections
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    async fn discard_empty(&self, address: &str, slot: &Slot) {
        let mut connections = self.connections.write().await;
        if let Some(current) = connections.get(address)
            && Arc::ptr_eq(current, slot)
            && !current.initialized()
        {
            connections.remove(address);
        }
    }

    /// Close and evict one connection. Returns whether one was cached.
    pub async fn remove(&self, address: &str) -> bool {
        let removed = self.connections.write().await.remove(address);
        match removed.as_ref().and_then(|slot| slot.get()) {
            Some(channel) => {
                channel.close();
                debug!(address, "evicted node connection");
                true
            }
            None => false,
        }
    }

    /// Close and evict every connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        let mut closed = 0;
        for channel in drained.iter().filter_map(|(_, slot)| slot.get()) {
            channel.close();
            closed += 1;
        }
        info!(count = closed, "closed all node connections");
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.connections
            .read()
            .await
            .get(address)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn len(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDaemon, MockDialer};
    use std::time::Duration;

    fn same(a: &Arc<dyn RpcChannel>, b: &Arc<dyn RpcChannel>) -> bool {
        Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
    }

    #[tokio::test]
    async fn test_second_get_reuses_connection() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("10.0.0.1:8443", MockDaemon::new("t"));
        let registry = ConnectionRegistry::new(dialer.clone());

        let first = registry.get("10.0.0.1:8443").await.unwrap();
        let second = registry.get("10.0.0.1:8443").await.unwrap();

        assert!(same(&first, &second));
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_dials_once() {
        let dialer = Arc::new(MockDialer::new().with_dial_delay(Duration::from_millis(50)));
        dialer.add_daemon("10.0.0.1:8443", MockDaemon::new("t"));
        let registry = Arc::new(ConnectionRegistry::new(dialer.clone()));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get("10.0.0.1:8443").await.unwrap() })
            })
            .collect();

        let channels: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(dialer.dial_count(), 1);
        assert!(channels.iter().all(|c| same(c, &channels[0])));
    }

    #[tokio::test]
    async fn test_slow_dial_does_not_block_other_nodes() {
        let dialer = Arc::new(MockDialer::new().with_dial_delay(Duration::from_millis(500)));
        dialer.add_daemon("a:1", MockDaemon::new("t"));
        dialer.add_daemon("b:1", MockDaemon::new("t"));
        let registry = Arc::new(ConnectionRegistry::new(dialer.clone()));
        registry.get("a:1").await.unwrap();

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("b:1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        registry.get("a:1").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!registry.contains("b:1").await);

        pending.await.unwrap().unwrap();
        assert!(registry.contains("b:1").await);
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_dial_is_not_cached() {
        let dialer = Arc::new(MockDialer::new());
        let registry = ConnectionRegistry::new(dialer.clone());

        assert!(registry.get("10.0.0.9:8443").await.is_err());
        assert!(!registry.contains("10.0.0.9:8443").await);

        dialer.add_daemon("10.0.0.9:8443", MockDaemon::new("t"));
        assert!(registry.get("10.0.0.9:8443").await.is_ok());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_closes_and_redials() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("10.0.0.1:8443", MockDaemon::new("t"));
        let registry = ConnectionRegistry::new(dialer.clone());

        let first = registry.get("10.0.0.1:8443").await.unwrap();
        assert!(registry.remove("10.0.0.1:8443").await);
        assert!(!first.is_open());
        assert!(!registry.remove("10.0.0.1:8443").await);

        let second = registry.get("10.0.0.1:8443").await.unwrap();
        assert!(!same(&first, &second));
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let dialer = Arc::new(MockDialer::new());
        dialer.add_daemon("a:1", MockDaemon::new("t"));
        dialer.add_daemon("b:1", MockDaemon::new("t"));
        let registry = ConnectionRegistry::new(dialer);

        let a = registry.get("a:1").await.unwrap();
        let b = registry.get("b:1").await.unwrap();
        registry.close_all().await;

        assert!(registry.is_empty().await);
        assert!(!a.is_open());
        assert!(!b.is_open());
    }
}
