// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port allocation tests.

mod common;

use std::collections::{BTreeMap, HashSet};

use common::{TestContext, workload_request};
use futures::future::join_all;
use hangar_control::persistence::NewWorkload;
use hangar_control::{ControlError, PortAllocator, PortRange, WorkloadStatus};

#[tokio::test]
async fn test_concurrent_assignments_get_distinct_ports() {
    let ctx = TestContext::new().await;
    let (node, _daemon) = ctx.add_node("fra-1", "10.0.0.1").await;
    let user = ctx.funded_user("alice").await;
    let persistence = ctx.plane.persistence().clone();

    let mut ids = Vec::new();
    for i in 0..12 {
        let workload = persistence
            .insert_workload(&NewWorkload {
                owner_id: user.id.clone(),
                node_id: node.id.clone(),
                name: format!("w{}", i),
                image: "img".into(),
                ram_mb: 256,
                disk_mb: 256,
                cpu_percent: 25,
                env: BTreeMap::new(),
            })
            .await
            .unwrap();
        ids.push(workload.id);
    }

    let allocator = PortAllocator::new(persistence.clone(), PortRange::default());
    let results = join_all(ids.iter().map(|id| allocator.assign(id, &node.id))).await;

    let ports: Vec<i32> = results.into_iter().map(|r| r.unwrap().port).collect();
    let unique: HashSet<i32> = ports.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(ports.iter().all(|p| (25565..=25600).contains(p)));

    for id in &ids {
        let workload = persistence.get_workload(id).await.unwrap().unwrap();
        let primary = workload.primary_allocation_id.expect("primary bound");
        let allocation = persistence.get_allocation(&primary).await.unwrap().unwrap();
        assert_eq!(allocation.workload_id.as_deref(), Some(id.as_str()));
        assert_eq!(allocation.ip, "10.0.0.1");
        assert!(allocation.assigned);
    }
}

#[tokio::test]
async fn test_ports_are_scoped_per_node() {
    let ctx = TestContext::new().await;
    let (fra, _) = ctx.add_node("fra-1", "10.0.0.1").await;
    let (ams, _) = ctx.add_node("ams-1", "10.0.0.2").await;
    let user = ctx.funded_user("alice").await;

    let a = ctx
        .plane
        .workloads()
        .create(workload_request(&user, &fra))
        .await
        .unwrap();
    let b = ctx
        .plane
        .workloads()
        .create(workload_request(&user, &ams))
        .await
        .unwrap();

    assert_eq!(a.allocation.unwrap().port, 25565);
    assert_eq!(b.allocation.unwrap().port, 25565);
}

#[tokio::test]
async fn test_exhausted_range_defers_provisioning_until_retry() {
    let ctx = TestContext::with_range(PortRange::new(25565, 25566).unwrap()).await;
    let (node, daemon) = ctx.add_node("fra-1", "10.0.0.1").await;
    let user = ctx.funded_user("alice").await;
    let workloads = ctx.plane.workloads();

    for _ in 0..2 {
        let created = workloads.create(workload_request(&user, &node)).await.unwrap();
        assert!(created.allocation.is_some());
        created.provisioning.unwrap().await.unwrap();
    }

    let mut request = workload_request(&user, &node);
    request.ram_mb = 1024;
    let created = workloads.create(request).await.unwrap();
    assert!(created.allocation.is_none());
    assert!(created.provisioning.is_none());

    let stuck = workloads.get(&created.workload.id).await.unwrap();
    assert_eq!(stuck.status().unwrap(), WorkloadStatus::Installing);
    assert!(stuck.primary_allocation_id.is_none());
    assert_eq!(
        daemon
            .call_names()
            .iter()
            .filter(|c| **c == "create_workload")
            .count(),
        2
    );

    // Same range is still full.
    let err = workloads
        .retry_allocation(&stuck.id, None)
        .await
        .unwrap_err();
    match err {
        ControlError::PortRangeExhausted { range, .. } => assert_eq!(range, "25565-25566"),
        other => panic!("unexpected: {:?}", other),
    }

    let retried = workloads
        .retry_allocation(&stuck.id, PortRange::new(25565, 25570))
        .await
        .unwrap();
    assert_eq!(retried.allocation.as_ref().unwrap().port, 25567);
    retried.provisioning.unwrap().await.unwrap();

    let settled = workloads.get(&stuck.id).await.unwrap();
    assert_eq!(settled.status().unwrap(), WorkloadStatus::Running);
    assert_eq!(
        daemon.last_create().unwrap().allocations[0].port,
        25567
    );
}

#[tokio::test]
async fn test_retry_refused_once_allocated() {
    let ctx = TestContext::new().await;
    let (node, _daemon) = ctx.add_node("fra-1", "10.0.0.1").await;
    let user = ctx.funded_user("alice").await;

    let created = ctx
        .plane
        .workloads()
        .create(workload_request(&user, &node))
        .await
        .unwrap();
    created.provisioning.unwrap().await.unwrap();

    let err = ctx
        .plane
        .workloads()
        .retry_allocation(&created.workload.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_delete_releases_port() {
    let ctx = TestContext::with_range(PortRange::new(30000, 30000).unwrap()).await;
    let (node, _daemon) = ctx.add_node("fra-1", "10.0.0.1").await;
    let user = ctx.funded_user("alice").await;
    let workloads = ctx.plane.workloads();

    let first = workloads.create(workload_request(&user, &node)).await.unwrap();
    first.provisioning.unwrap().await.unwrap();
    assert_eq!(
        workloads.allocations(&first.workload.id).await.unwrap().len(),
        1
    );

    let blocked = workloads.create(workload_request(&user, &node)).await.unwrap();
    assert!(blocked.allocation.is_none());

    workloads.delete(&first.workload.id).await.unwrap();

    let retried = workloads
        .retry_allocation(&blocked.workload.id, None)
        .await
        .unwrap();
    assert_eq!(retried.allocation.unwrap().port, 30000);
}
