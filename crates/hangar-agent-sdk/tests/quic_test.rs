// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests over real QUIC: a MockDaemon served by an AgentServer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hangar_agent_sdk::mock::MockDaemon;
use hangar_agent_sdk::{
    AgentClient, AgentConfig, ConnectionRegistry, NodeProbe, ProbeStatus, QuicDialer,
};
use hangar_protocol::AgentServer;
use hangar_protocol::agent_proto::AgentRequest;

async fn serve(daemon: MockDaemon) -> (SocketAddr, Arc<MockDaemon>) {
    let daemon = Arc::new(daemon);
    let server = AgentServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let handler_daemon = daemon.clone();
    tokio::spawn(async move {
        let _ = server
            .run(move |request: AgentRequest| {
                let daemon = handler_daemon.clone();
                async move { daemon.handle(request) }
            })
            .await;
    });

    (addr, daemon)
}

fn dialer() -> Arc<QuicDialer> {
    Arc::new(
        QuicDialer::new(&AgentConfig::insecure().with_dial_timeout(Duration::from_secs(5)))
            .unwrap(),
    )
}

#[tokio::test]
async fn test_registry_and_client_over_quic() {
    let (addr, daemon) = serve(MockDaemon::new("node-token")).await;
    let registry = ConnectionRegistry::new(dialer());
    let address = addr.to_string();

    let channel = registry.get(&address).await.unwrap();
    let client = AgentClient::new(channel, "node-token");

    assert_eq!(client.ping().await.unwrap(), "mock");
    let outcome = client.start_workload("w-1").await.unwrap();
    assert!(outcome.success);

    let again = registry.get(&address).await.unwrap();
    assert!(again.is_open());
    assert_eq!(registry.len().await, 1);
    assert_eq!(daemon.call_names(), vec!["ping", "start_workload"]);

    registry.close_all().await;
}

#[tokio::test]
async fn test_probe_over_quic() {
    let (addr, _) = serve(MockDaemon::new("node-token")).await;
    let probe = NodeProbe::new(dialer());

    let report = probe.probe(&addr.to_string(), "node-token").await;
    assert_eq!(report.status, ProbeStatus::Reachable);
    assert!(report.stats.is_some());

    let report = probe.probe(&addr.to_string(), "stolen").await;
    assert_eq!(report.status, ProbeStatus::Unauthorized);
}

#[tokio::test]
async fn test_probe_unreachable_over_quic() {
    let probe = NodeProbe::new(Arc::new(
        QuicDialer::new(&AgentConfig::insecure().with_dial_timeout(Duration::from_millis(200)))
            .unwrap(),
    ));
    let report = probe.probe("127.0.0.1:59991", "t").await;
    assert_eq!(report.status, ProbeStatus::Unreachable);
}
