use std::net::SocketAddr;

use sequin::{
    broker::{
        endpoint::{BrokerEndpoint, NodeTls, QuicConnector, Trust, DEFAULT_SERVER_NAME},
        memory::MemoryCluster,
        CloseCause, Connector, Event, CLOSE_ADMINISTRATIVE,
    },
    client::{
        body::SequenceShape,
        publisher::Publisher,
        roster::{Node, NodeRoster},
        supervisor::ConnectionSupervisor,
    },
    config::{PublisherConfig, SupervisorConfig},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct LocalNode {
    cluster: MemoryCluster,
    node: SocketAddr,
    listen: SocketAddr,
    trust: Option<Trust>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

async fn local_node(port: u16) -> LocalNode {
    let node = SocketAddr::from(([127, 0, 0, 1], port));
    let cluster = MemoryCluster::with_nodes(&[node]).await;
    cluster.declare_queue("sequence").await;

    let tls = NodeTls::self_signed(vec![DEFAULT_SERVER_NAME.into()]).unwrap();
    let trust = Trust::Roots(vec![tls.certificate().clone()]);
    let endpoint = BrokerEndpoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), &tls).unwrap();
    let listen = endpoint.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(endpoint.serve(cluster.clone(), node, shutdown.clone()));
    LocalNode {
        cluster,
        node,
        listen,
        trust: Some(trust),
        shutdown,
        server,
    }
}

#[tokio::test]
async fn publisher_runs_over_quic() {
    let mut local = local_node(48_001).await;
    let connector = QuicConnector::new(local.trust.take().unwrap(), DEFAULT_SERVER_NAME).unwrap();
    let roster = NodeRoster::new(vec![Node {
        name: "node1".into(),
        addr: local.listen,
    }]);
    let supervisor = ConnectionSupervisor::new(
        connector,
        roster,
        SupervisorConfig::default(),
        CancellationToken::new(),
    );
    let config = PublisherConfig::builder()
        .target(2_000)
        .shape(SequenceShape::plain("sequence"))
        .build();

    let outcome = Publisher::new(supervisor, config).run().await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.summary.positive, 2_000);
    assert_eq!(local.cluster.queue_depth("sequence").await, Some(2_000));

    local.shutdown.cancel();
    local.server.await.unwrap();
}

#[tokio::test]
async fn administrative_close_reaches_the_client() {
    let mut local = local_node(48_002).await;
    let connector = QuicConnector::new(local.trust.take().unwrap(), DEFAULT_SERVER_NAME).unwrap();
    let mut conn = connector.connect(local.listen).await.unwrap();
    conn.consume("sequence").unwrap();
    // wait for the bridge to attach before closing the node's links
    while local
        .cluster
        .close_node_connections(
            local.node,
            CloseCause::Administrative {
                code: CLOSE_ADMINISTRATIVE,
                reason: "forced by operator".into(),
            },
        )
        .await
        == 0
    {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    match conn.next_event().await {
        Some(Event::Closed(CloseCause::Administrative { code, reason })) => {
            assert_eq!(code, CLOSE_ADMINISTRATIVE);
            assert_eq!(reason, "forced by operator");
        }
        other => panic!("expected an administrative close, got {other:?}"),
    }
    assert!(!conn.is_open());

    local.shutdown.cancel();
    local.server.await.unwrap();
}

#[tokio::test]
async fn unverified_trust_still_connects() {
    let local = local_node(48_003).await;
    let connector = QuicConnector::new(Trust::AnyNode, "not-the-cert-name").unwrap();
    let mut conn = connector.connect(local.listen).await.unwrap();
    conn.confirm_select().unwrap();
    conn.publish(
        sequin::broker::Message::builder()
            .routing_key("sequence")
            .body("1")
            .build(),
    )
    .unwrap();
    assert!(matches!(conn.next_event().await, Some(Event::Confirm(_))));
    conn.close();

    local.shutdown.cancel();
    local.server.await.unwrap();
}

#[tokio::test]
async fn node_shutdown_fails_over_to_the_next_node() {
    let nodes = [
        SocketAddr::from(([127, 0, 0, 1], 48_011)),
        SocketAddr::from(([127, 0, 0, 1], 48_012)),
    ];
    let cluster = MemoryCluster::with_nodes(&nodes).await;
    cluster.declare_queue("sequence").await;
    cluster.hold_confirms(true).await;

    let tls = NodeTls::self_signed(vec![DEFAULT_SERVER_NAME.into()]).unwrap();
    let mut servers = Vec::new();
    let mut listens = Vec::new();
    for node in nodes {
        let endpoint = BrokerEndpoint::bind(SocketAddr::from(([127, 0, 0, 1], 0)), &tls).unwrap();
        listens.push(endpoint.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(endpoint.serve(cluster.clone(), node, shutdown.clone()));
        servers.push((shutdown, server));
    }

    let trust = Trust::Roots(vec![tls.certificate().clone()]);
    let connector = QuicConnector::new(trust, DEFAULT_SERVER_NAME).unwrap();
    let roster = NodeRoster::new(
        listens
            .iter()
            .enumerate()
            .map(|(i, &addr)| Node {
                name: format!("node{}", i + 1),
                addr,
            })
            .collect(),
    );
    let client_shutdown = CancellationToken::new();
    let supervisor = ConnectionSupervisor::new(
        connector,
        roster,
        SupervisorConfig::default(),
        client_shutdown.clone(),
    );
    let config = PublisherConfig::builder()
        .target(500)
        .shape(SequenceShape::plain("sequence"))
        .build();
    let run = tokio::spawn(Publisher::new(supervisor, config).run());

    while cluster.published().await < 500 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let (node1_shutdown, node1_server) = servers.remove(0);
    node1_shutdown.cancel();
    node1_server.await.unwrap();
    // the publisher has moved on once it publishes the next 500 elsewhere
    while cluster.published().await < 1_000 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    cluster.hold_confirms(false).await;

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!client_shutdown.is_cancelled());
    assert!(outcome.completed);
    assert_eq!(outcome.summary.positive, 500);
    assert_eq!(outcome.summary.abandoned, 500);
    assert_eq!(outcome.positions, 1_000);
    assert_eq!(outcome.undelivered.possibly_lost, (1..=500).collect::<Vec<_>>());

    for (shutdown, server) in servers {
        shutdown.cancel();
        server.await.unwrap();
    }
}
