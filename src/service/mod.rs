use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

pub mod app;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod net;
pub mod snapshot;
pub mod store;
pub mod timer;

pub use app::{ApplicationHeader, ApplicationKind, ApplicationMessage, ApplicationPort};
pub use config::{in_memory_neighbors, Neighbor, NodeConfig, NodeInfo, DEFAULT_SNAPSHOT_DELAY};
pub use dispatcher::{Dispatcher, Shutdown};
pub use net::{Error, Link};
pub use store::{DirStore, MemoryStore, SnapshotMatrix, SnapshotRecord, SnapshotStore};

pub type NodeId = u32;

/// The node that starts snapshot rounds and decides termination.
pub const COORDINATOR: NodeId = 0;

/// Starts a node's service at most once.
#[derive(Default)]
pub struct Supervisor {
    started: bool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawns one receiver per neighbor link and the dispatcher that owns the
    /// node's protocol state. Must be called from within a tokio runtime.
    pub fn start(
        &mut self,
        config: NodeConfig,
        store: Box<dyn SnapshotStore>,
    ) -> Result<(ServiceHandle, ApplicationPort), Error> {
        if self.started {
            Err(Error::AlreadyStarted)?
        }
        config.validate()?;
        self.started = true;

        let info = NodeInfo::from(&config);
        info!(
            "initiating service on node {} ({} nodes, neighbors {:?})",
            info.id, info.node_count, info.neighbors
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(config.neighbors.len());
        let mut receivers = Vec::with_capacity(config.neighbors.len());
        for neighbor in config.neighbors {
            let (send_stream, recv_stream) = neighbor.link.into_streams(neighbor.id);
            senders.push(send_stream);
            let receiver = net::LinkReceiver::new(info.id, recv_stream, inbound_tx.clone());
            receivers.push(tokio::spawn(receiver.run()));
        }
        drop(inbound_tx);

        let (service_port, app_port) = app::boundary();
        let dispatcher = Dispatcher::new(info.clone(), senders, inbound_rx, service_port, store);
        let dispatcher = tokio::spawn(dispatcher.run());

        Ok((
            ServiceHandle {
                node: info.id,
                dispatcher,
                receivers,
            },
            app_port,
        ))
    }
}

/// A running node service.
pub struct ServiceHandle {
    node: NodeId,
    dispatcher: JoinHandle<Shutdown>,
    receivers: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Waits for the dispatcher to stop, then abandons the link receivers.
    pub async fn join(self) -> Result<Shutdown, Error> {
        let result = self.dispatcher.await;
        for receiver in &self.receivers {
            receiver.abort();
        }
        match result {
            Ok(shutdown) => {
                debug!("node {} stopped: {:?}", self.node, shutdown);
                Ok(shutdown)
            }
            Err(_) => Err(Error::DispatcherStopped),
        }
    }

    /// Stops the service without waiting for termination.
    pub fn abort(&self) {
        self.dispatcher.abort();
        for receiver in &self.receivers {
            receiver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_only_once() {
        let mut supervisor = Supervisor::new();
        let config = || NodeConfig::builder().id(1).node_count(2).build();

        let (handle, _app) = supervisor.start(config(), Box::new(MemoryStore::new())).unwrap();
        assert!(supervisor.is_started());
        assert!(matches!(
            supervisor.start(config(), Box::new(MemoryStore::new())),
            Err(Error::AlreadyStarted)
        ));
        handle.abort();
    }

    #[tokio::test]
    async fn invalid_config_does_not_consume_the_start() {
        let mut supervisor = Supervisor::new();
        let bad = NodeConfig::builder().id(5).node_count(2).build();
        assert!(matches!(
            supervisor.start(bad, Box::new(MemoryStore::new())),
            Err(Error::InvalidConfig(_))
        ));
        assert!(!supervisor.is_started());
    }

    #[tokio::test]
    async fn application_gets_a_state_query_on_start() {
        let mut supervisor = Supervisor::new();
        let config = NodeConfig::builder().id(1).node_count(2).build();
        let (handle, mut app) = supervisor.start(config, Box::new(MemoryStore::new())).unwrap();
        let query = app.recv().await.unwrap();
        assert_eq!(query.kind(), ApplicationKind::StateQuery);
        assert_eq!(query.header.dst, 1);
        handle.abort();
    }
}
