use hashbrown::HashMap;
use tokio::{select, sync::mpsc};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use super::{
    app::{ApplicationKind, ApplicationMessage, ServicePort},
    clock::VectorClock,
    config::NodeInfo,
    net::{LinkSendStream, MessageKind, ServiceMessage},
    snapshot::{Effect, RoundOutcome, SnapshotController},
    store::SnapshotStore,
    timer::SnapshotTimer,
    NodeId,
};

/// How a dispatcher stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// Global termination was declared (on the coordinator) or received.
    Terminated { seq: u32 },
}

enum Event {
    Link(NodeId, ServiceMessage),
    Application(ApplicationMessage),
    TimerExpired,
    /// Nothing arrived within the snapshot delay.
    Quiet,
}

/// The only owner of a node's protocol state. Receivers and the application
/// push into it; it is the only writer to links and to the application.
pub struct Dispatcher {
    info: NodeInfo,
    clock: VectorClock,
    snapshots: SnapshotController,
    timer: SnapshotTimer,
    senders: HashMap<NodeId, LinkSendStream>,
    inbound_rx: mpsc::UnboundedReceiver<(NodeId, ServiceMessage)>,
    app: ServicePort,
    store: Box<dyn SnapshotStore>,
}

impl Dispatcher {
    pub(crate) fn new(
        info: NodeInfo,
        senders: Vec<LinkSendStream>,
        inbound_rx: mpsc::UnboundedReceiver<(NodeId, ServiceMessage)>,
        app: ServicePort,
        store: Box<dyn SnapshotStore>,
    ) -> Self {
        Self {
            clock: VectorClock::new(info.id, info.node_count),
            snapshots: SnapshotController::new(&info),
            timer: SnapshotTimer::new(info.snapshot_delay),
            senders: senders.into_iter().map(|s| (s.peer(), s)).collect(),
            inbound_rx,
            app,
            store,
            info,
        }
    }

    pub async fn run(mut self) -> Shutdown {
        let span = debug_span!("dispatcher", node = self.info.id);
        async move {
            debug!("dispatcher started");
            if self.app.tx.send(ApplicationMessage::state_query(self.info.id)).is_err() {
                debug!("application boundary already closed");
            }

            loop {
                if self.info.is_coordinator() && !self.snapshots.is_active() && self.timer.arm() {
                    trace!("waiting {:?} before the next snapshot round", self.info.snapshot_delay);
                }

                if self.info.is_coordinator()
                    && self.timer.is_expired()
                    && !self.snapshots.is_active()
                {
                    let mut effects = Vec::new();
                    self.snapshots.begin_round(self.clock.as_slice(), &mut effects);
                    self.execute(effects).await;
                    if let Some(shutdown) = self.poll_round().await {
                        return shutdown;
                    }
                }

                let event = select! {
                    Some((from, msg)) = self.inbound_rx.recv() => Event::Link(from, msg),
                    Some(msg) = self.app.rx.recv() => Event::Application(msg),
                    _ = self.timer.expired() => Event::TimerExpired,
                    _ = tokio::time::sleep(self.info.snapshot_delay) => Event::Quiet,
                };

                match event {
                    Event::Link(from, msg) => {
                        if let Some(shutdown) = self.handle_link_message(from, msg).await {
                            return shutdown;
                        }
                    }
                    Event::Application(msg) => self.handle_application_message(msg).await,
                    Event::TimerExpired => debug!("snapshot round requested"),
                    Event::Quiet => trace!("no input within {:?}", self.info.snapshot_delay),
                }

                // completion can hinge on any mix of earlier arrivals
                if let Some(shutdown) = self.poll_round().await {
                    return shutdown;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_link_message(&mut self, from: NodeId, msg: ServiceMessage) -> Option<Shutdown> {
        let mut effects = Vec::new();
        let mut outcome = None;
        match msg.kind() {
            MessageKind::Application => self.deliver_to_application(from, msg),
            MessageKind::Marker => {
                self.snapshots.on_marker(from, &msg, self.clock.as_slice(), &mut effects)
            }
            MessageKind::MarkerAck => self.snapshots.on_ack(from, &msg),
            MessageKind::MarkerNack => self.snapshots.on_nack(from, &msg),
            MessageKind::Ccast => self.snapshots.on_ccast(from, &msg, &mut effects),
            MessageKind::MarkerTerm => outcome = self.snapshots.on_term(from, &msg, &mut effects),
        }
        self.execute(effects).await;
        match outcome {
            Some(RoundOutcome::Terminated { seq }) => Some(Shutdown::Terminated { seq }),
            _ => None,
        }
    }

    /// Merges the sender's clock and hands the payload up.
    fn deliver_to_application(&mut self, from: NodeId, msg: ServiceMessage) {
        match &msg.clock {
            Some(remote) => self.clock.merge_incoming(remote),
            None => {
                warn!("application message from node {} carried no clock", from);
                self.clock.merge_incoming(&[]);
            }
        }
        trace!("clock after delivery from node {}: {:?}", from, self.clock.as_slice());

        let data = msg.data.unwrap_or_default();
        let delivery = ApplicationMessage::message(msg.header.src, self.info.id, data);
        if self.app.tx.send(delivery).is_err() {
            debug!("application gone, dropping message from node {}", from);
        }
    }

    async fn handle_application_message(&mut self, msg: ApplicationMessage) {
        match msg.kind() {
            ApplicationKind::StateReply => {
                let spark = msg.header.state != 0;
                debug!("application reports spark {}", spark);
                self.snapshots.set_spark(spark);
            }
            ApplicationKind::Message => {
                self.snapshots.set_spark(true);
                let dst = msg.header.dst;
                if !self.senders.contains_key(&dst) {
                    warn!("application addressed node {} which is not a neighbor, dropping", dst);
                    return;
                }
                let clock = self.clock.stamp_outgoing();
                let out =
                    ServiceMessage::control(MessageKind::Application, self.info.id, dst, 0, true)
                        .with_clock(clock)
                        .with_data(msg.data.unwrap_or_default());
                self.send(out).await;
            }
            ApplicationKind::StateQuery => {
                warn!("application sent a state query, ignoring it");
            }
        }
    }

    async fn poll_round(&mut self) -> Option<Shutdown> {
        let mut effects = Vec::new();
        let outcome = self.snapshots.poll(&mut effects);
        self.execute(effects).await;
        match outcome? {
            RoundOutcome::Completed { seq } => {
                debug!("round {} complete", seq);
                self.timer.disarm();
                None
            }
            RoundOutcome::Terminated { seq } => {
                info!("terminating, TERM {} sent", seq);
                Some(Shutdown::Terminated { seq })
            }
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(msg) => self.send(msg).await,
                Effect::Persist(record) => {
                    if let Err(e) = self.store.save(&record) {
                        error!("could not save snapshot {}: {}", record.seq, e);
                    }
                }
            }
        }
    }

    async fn send(&mut self, msg: ServiceMessage) {
        let dst = msg.header.dst;
        match self.senders.get_mut(&dst) {
            Some(sender) => {
                if let Err(e) = sender.send(&msg).await {
                    error!("could not send {:?} to node {}: {}", msg.kind(), dst, e);
                }
            }
            None => error!("no link to node {}", dst),
        }
    }
}
