// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backend tests.
//!
//! The Postgres tests run against a live database and skip themselves when
//! `HANGAR_TEST_DATABASE_URL` is unset.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use hangar_control::PortRange;
use hangar_control::persistence::{
    self, NewNode, NewWorkload, Persistence, PoolDelta, SqlitePersistence,
};
use uuid::Uuid;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("HANGAR_TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: HANGAR_TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn postgres() -> Arc<dyn Persistence> {
    let url = std::env::var("HANGAR_TEST_DATABASE_URL").expect("database url");
    persistence::connect(&url).await.expect("connect to postgres")
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn node(host: &str) -> NewNode {
    NewNode {
        name: unique("node"),
        host: host.to_string(),
        rpc_port: 8443,
        daemon_token: "token".to_string(),
        total_ram_mb: 32 * 1024,
        total_disk_mb: 512 * 1024,
    }
}

fn workload(owner_id: &str, node_id: &str, name: &str) -> NewWorkload {
    NewWorkload {
        owner_id: owner_id.to_string(),
        node_id: node_id.to_string(),
        name: name.to_string(),
        image: "img".to_string(),
        ram_mb: 128,
        disk_mb: 128,
        cpu_percent: 10,
        env: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_connect_rejects_unknown_scheme() {
    let err = persistence::connect("mysql://localhost/hangar")
        .await
        .err()
        .expect("unsupported scheme");
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("hangar.db");

    let node_id = {
        let store = SqlitePersistence::from_path(&path).await.unwrap();
        let created = store.insert_node(&node("10.0.0.1")).await.unwrap();
        store.pool().close().await;
        created.id
    };

    let store = SqlitePersistence::from_path(&path).await.unwrap();
    let reloaded = store.get_node(&node_id).await.unwrap().unwrap();
    assert_eq!(reloaded.host, "10.0.0.1");
    assert_eq!(reloaded.total_ram_mb, 32 * 1024);
}

#[tokio::test]
async fn test_postgres_concurrent_assignments_are_distinct() {
    skip_if_no_db!();
    let store = postgres().await;

    let node = store.insert_node(&node("10.1.0.1")).await.unwrap();
    let user = store.create_user(&unique("user"), 0).await.unwrap();
    store
        .add_resource_pool(
            &user.id,
            PoolDelta {
                ram_mb: 8192,
                cpu_cores: 8,
                storage_mb: 8192,
            },
        )
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..16 {
        let w = store
            .insert_workload(&workload(&user.id, &node.id, &format!("w{}", i)))
            .await
            .unwrap();
        ids.push(w.id);
    }

    let range = PortRange::default();
    let results = join_all(ids.iter().map(|id| store.assign_port(id, &node.id, &range))).await;
    let ports: HashSet<i32> = results.into_iter().map(|r| r.unwrap().port).collect();
    assert_eq!(ports.len(), ids.len());

    for id in &ids {
        assert!(store.delete_workload(id).await.unwrap());
    }
    assert!(store.delete_node(&node.id).await.unwrap());
}

#[tokio::test]
async fn test_postgres_concurrent_spends_never_overdraw() {
    skip_if_no_db!();
    let store = postgres().await;

    let user = store.create_user(&unique("user"), 100).await.unwrap();

    let results = join_all((0..10).map(|_| store.spend(&user.id, 15, "race"))).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 6);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert_eq!(err.error_code(), "INSUFFICIENT_BALANCE");
    }

    let pool = store.get_resource_pool(&user.id).await.unwrap().unwrap();
    assert_eq!(pool.granted_balance, 10);
    let spends = store
        .list_ledger_entries(&user.id, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == "spend")
        .count();
    assert_eq!(spends, 6);
}

#[tokio::test]
async fn test_postgres_pool_check_serializes_workload_inserts() {
    skip_if_no_db!();
    let store = postgres().await;

    let node = store.insert_node(&node("10.1.0.2")).await.unwrap();
    let user = store.create_user(&unique("user"), 0).await.unwrap();
    store
        .add_resource_pool(
            &user.id,
            PoolDelta {
                ram_mb: 512,
                cpu_cores: 1,
                storage_mb: 1024,
            },
        )
        .await
        .unwrap();

    // Room for exactly four 128 MB workloads.
    let requests: Vec<NewWorkload> = (0..8)
        .map(|i| workload(&user.id, &node.id, &format!("w{}", i)))
        .collect();
    let results = join_all(requests.iter().map(|w| store.insert_workload(w))).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);

    let usage = store.resource_usage(&user.id).await.unwrap();
    assert_eq!(usage.ram_mb, 512);
    let reloaded = store.get_node(&node.id).await.unwrap().unwrap();
    assert_eq!(reloaded.allocated_ram_mb, 512);

    for w in results.into_iter().flatten() {
        store.delete_workload(&w.id).await.unwrap();
    }
    store.delete_node(&node.id).await.unwrap();
}
