use std::time::Duration;

use tokio::{task::JoinHandle, time::timeout};
use vigil::service::{
    in_memory_neighbors, ApplicationKind, ApplicationPort, MemoryStore, NodeConfig, NodeId,
    ServiceHandle, Shutdown, Supervisor,
};

const DELAY: Duration = Duration::from_millis(50);

struct Node {
    handle: ServiceHandle,
    store: MemoryStore,
}

fn start_cluster(
    node_count: usize,
    edges: &[(NodeId, NodeId)],
) -> (Vec<Node>, Vec<ApplicationPort>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut nodes = Vec::new();
    let mut ports = Vec::new();
    for (id, neighbors) in in_memory_neighbors(node_count, edges, 64 * 1024)
        .into_iter()
        .enumerate()
    {
        let config = NodeConfig::builder()
            .id(id as NodeId)
            .node_count(node_count)
            .neighbors(neighbors)
            .snapshot_delay(DELAY)
            .build();
        let store = MemoryStore::new();
        let (handle, port) = Supervisor::new()
            .start(config, Box::new(store.clone()))
            .unwrap();
        nodes.push(Node { handle, store });
        ports.push(port);
    }
    (nodes, ports)
}

/// Answers the state query with "no work" and drains everything else.
fn idle_application(node: NodeId, mut port: ApplicationPort) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(msg) = port.recv().await {
            match msg.kind() {
                ApplicationKind::StateQuery => {
                    let _ = port.reply_state(node, false);
                }
                ApplicationKind::Message => delivered += 1,
                ApplicationKind::StateReply => {}
            }
        }
        delivered
    })
}

async fn join_all(nodes: Vec<Node>) -> Vec<(Shutdown, MemoryStore)> {
    let mut results = Vec::new();
    for node in nodes {
        let shutdown = timeout(Duration::from_secs(10), node.handle.join())
            .await
            .expect("node never terminated")
            .unwrap();
        results.push((shutdown, node.store));
    }
    results
}

#[tokio::test]
async fn idle_line_terminates_after_one_round() {
    let (nodes, ports) = start_cluster(3, &[(0, 1), (1, 2)]);
    let apps: Vec<_> = ports
        .into_iter()
        .enumerate()
        .map(|(id, port)| idle_application(id as NodeId, port))
        .collect();

    let results = join_all(nodes).await;
    for (shutdown, _) in &results {
        assert_eq!(*shutdown, Shutdown::Terminated { seq: 2 });
    }

    let coordinator = results[0].1.records();
    assert_eq!(coordinator.len(), 1);
    let matrix = coordinator[0].matrix.as_ref().unwrap();
    assert_eq!(matrix.node_count(), 3);
    assert_eq!(coordinator[0].consistent, Some(true));
    for (id, (_, store)) in results.iter().enumerate() {
        let records = store.records();
        assert_eq!(records.len(), 1, "node {} kept one record", id);
        assert_eq!(matrix.rows[id], records[0].clock);
    }

    for app in apps {
        assert_eq!(app.await.unwrap(), 0);
    }
}

#[tokio::test]
async fn busy_coordinator_delays_termination() {
    let (nodes, mut ports) = start_cluster(3, &[(0, 1), (1, 2)]);
    let far_end = idle_application(2, ports.remove(2));
    let receiver = idle_application(1, ports.remove(1));
    let mut producer_port = ports.remove(0);

    let producer = tokio::spawn(async move {
        for i in 0..10 {
            let _ = producer_port.send(0, 1, format!("work item {}", i).into_bytes());
            tokio::time::sleep(DELAY / 5).await;
        }
        let _ = producer_port.reply_state(0, false);
        while producer_port.recv().await.is_some() {}
    });

    let results = join_all(nodes).await;
    let coordinator = results[0].1.records();
    assert!(coordinator.len() >= 2, "the first round saw pending work");
    assert!(coordinator.iter().all(|r| r.consistent == Some(true)));
    assert!(coordinator[0].spark);
    assert!(!coordinator.last().unwrap().spark);

    // every stamped send from node 0 shows up in node 1's recorded clocks
    let last_row = &coordinator.last().unwrap().matrix.as_ref().unwrap().rows[1];
    assert_eq!(last_row[0], 10);

    producer.await.unwrap();
    assert_eq!(receiver.await.unwrap(), 10);
    assert_eq!(far_end.await.unwrap(), 0);
}

#[tokio::test]
async fn ring_terminates_everyone() {
    let edges = [(0, 1), (1, 2), (2, 3), (3, 4), (4, 0), (1, 3)];
    let (nodes, ports) = start_cluster(5, &edges);
    for (id, port) in ports.into_iter().enumerate() {
        idle_application(id as NodeId, port);
    }

    let results = join_all(nodes).await;
    assert!(results
        .iter()
        .all(|(s, _)| matches!(s, Shutdown::Terminated { .. })));
    let matrix = results[0].1.records()[0].matrix.clone().unwrap();
    assert_eq!(matrix.node_count(), 5);
    assert!(matrix.violations().is_empty());
}
