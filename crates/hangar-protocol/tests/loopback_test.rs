// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC loopback tests: a real AgentServer answered by a real NodeClient.

use std::time::Duration;

use hangar_protocol::agent_proto::{
    AgentRequest, AgentResponse, PingRequest, PingResponse, UNAUTHENTICATED, WorkloadRef,
    agent_request::Request, agent_response::Response,
};
use hangar_protocol::{AgentServer, NodeClient, NodeClientConfig};

async fn echo_daemon(token: &'static str) -> std::net::SocketAddr {
    let server = AgentServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server
            .run(move |request: AgentRequest| async move {
                if request.token != token {
                    return AgentResponse::error(UNAUTHENTICATED, "token mismatch");
                }
                match request.request {
                    Some(Request::Ping(_)) => AgentResponse {
                        response: Some(Response::Ping(PingResponse {
                            version: "test".to_string(),
                        })),
                    },
                    Some(Request::StartWorkload(w)) => {
                        AgentResponse::action(w.workload_id == "known", None)
                    }
                    _ => AgentResponse::error("UNIMPLEMENTED", "unsupported"),
                }
            })
            .await;
    });

    addr
}

#[tokio::test]
async fn test_ping_over_quic() {
    let addr = echo_daemon("secret").await;
    let client = NodeClient::new(&NodeClientConfig::insecure()).unwrap();
    let conn = client
        .connect(addr, "localhost", Duration::from_secs(5))
        .await
        .unwrap();

    let response: AgentResponse = conn
        .request(&AgentRequest {
            token: "secret".to_string(),
            request: Some(Request::Ping(PingRequest {})),
        })
        .await
        .unwrap();

    match response.response {
        Some(Response::Ping(p)) => assert_eq!(p.version, "test"),
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(conn.is_open());
    conn.close();
}

#[tokio::test]
async fn test_wrong_token_is_rejected_by_daemon() {
    let addr = echo_daemon("secret").await;
    let client = NodeClient::new(&NodeClientConfig::insecure()).unwrap();
    let conn = client
        .connect(addr, "localhost", Duration::from_secs(5))
        .await
        .unwrap();

    let response: AgentResponse = conn
        .request(&AgentRequest {
            token: "wrong".to_string(),
            request: Some(Request::Ping(PingRequest {})),
        })
        .await
        .unwrap();

    match response.response {
        Some(Response::Error(e)) => assert_eq!(e.code, UNAUTHENTICATED),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_many_requests_share_one_connection() {
    let addr = echo_daemon("secret").await;
    let client = NodeClient::new(&NodeClientConfig::insecure()).unwrap();
    let conn = client
        .connect(addr, "localhost", Duration::from_secs(5))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            let id = if i % 2 == 0 { "known" } else { "unknown" };
            let response: AgentResponse = conn
                .request(&AgentRequest {
                    token: "secret".to_string(),
                    request: Some(Request::StartWorkload(WorkloadRef {
                        workload_id: id.to_string(),
                    })),
                })
                .await
                .unwrap();
            (i, response)
        }));
    }

    for handle in handles {
        let (i, response) = handle.await.unwrap();
        match response.response {
            Some(Response::Action(a)) => assert_eq!(a.success, i % 2 == 0),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
