use std::time::Duration;

use tracing::{debug, info};
use vigil::service::{ApplicationKind, ApplicationPort, NodeId};

/// A toy application: sends `messages` payloads to its neighbors in turn, one
/// every `pace`, then tells the service it has nothing left to do. Returns how
/// many payloads were delivered to it.
pub async fn run(
    node: NodeId,
    neighbors: Vec<NodeId>,
    messages: usize,
    pace: Duration,
    mut port: ApplicationPort,
) -> usize {
    let mut delivered = 0;
    let mut sent = 0;
    let mut ticker = tokio::time::interval(pace);

    loop {
        tokio::select! {
            msg = port.recv() => match msg {
                Some(msg) => match msg.kind() {
                    ApplicationKind::StateQuery => {
                        let _ = port.reply_state(node, sent < messages && !neighbors.is_empty());
                    }
                    ApplicationKind::Message => {
                        delivered += 1;
                        let text = String::from_utf8_lossy(msg.data.as_deref().unwrap_or_default());
                        info!("node {} received from node {}: {}", node, msg.header.src, text);
                    }
                    ApplicationKind::StateReply => {}
                },
                None => break,
            },
            _ = ticker.tick(), if sent < messages && !neighbors.is_empty() => {
                let dst = neighbors[sent % neighbors.len()];
                let payload = format!("message {} from node {}", sent, node);
                if port.send(node, dst, payload.into_bytes()).is_err() {
                    break;
                }
                sent += 1;
                if sent == messages {
                    debug!("node {} finished its work", node);
                    let _ = port.reply_state(node, false);
                }
            }
        }
    }
    delivered
}
