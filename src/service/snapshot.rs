// Snapshot rounds follow Chandy-Lamport with a converge-cast on top. The
// coordinator floods markers; every other node records its clock when the
// first marker of a round reaches it and adopts that marker's sender as its
// parent. Marker replies tell the sender whether the edge became a tree edge
// (ACK) or not (NACK), so by the time every neighbor has answered a node
// knows exactly which neighbors are its children. Recorded clocks then flow
// back up the tree: each node relays whatever its children send it and sends
// its own clock last, once all of its children have sent theirs. Per-link
// FIFO delivery is what makes "own clock last" mean "subtree complete".
//
// The controller does no I/O. Every handler appends the messages it wants sent
// and the records it wants kept to an effect list which the dispatcher
// executes in order.

use chrono::Utc;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{
    config::NodeInfo,
    net::{MessageKind, ServiceMessage},
    store::{SnapshotMatrix, SnapshotRecord},
    NodeId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Markers are out; waiting for every neighbor to answer.
    AwaitingNeighborResponses,
    /// Tree known; waiting for the children's subtrees to report.
    AwaitingChildCcasts,
    /// Coordinator only: every clock is in and the round is being closed.
    Aggregating,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Send(ServiceMessage),
    Persist(SnapshotRecord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// This node's part of the round is done and its state is back to idle.
    Completed { seq: u32 },
    /// The computation has terminated; the node should stop.
    Terminated { seq: u32 },
}

/// Bookkeeping for the round in progress. Replaced wholesale when a round ends
/// so nothing carries over into the next one.
#[derive(Default)]
struct Session {
    recorded: Vec<u32>,
    /// Punch-card of neighbors that have answered our marker (or sent us one).
    responded: HashSet<NodeId>,
    parent: Option<NodeId>,
    children: HashSet<NodeId>,
    /// Children whose own CCAST has arrived, closing their subtree.
    finished_children: HashSet<NodeId>,
    /// Coordinator only: recorded clocks by node id.
    rows: HashMap<NodeId, Vec<u32>>,
    markers_sent: bool,
    spark: bool,
}

pub struct SnapshotController {
    id: NodeId,
    node_count: usize,
    neighbors: Vec<NodeId>,
    seq: u32,
    phase: Phase,
    session: Session,
    /// Latest liveness reported by the local application. Captured into the
    /// session and cleared whenever this node joins a round.
    spark: bool,
}

impl SnapshotController {
    pub fn new(info: &NodeInfo) -> Self {
        Self {
            id: info.id,
            node_count: info.node_count,
            neighbors: info.neighbors.clone(),
            seq: 0,
            phase: Phase::Idle,
            session: Session::default(),
            spark: false,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.id == super::COORDINATOR
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Sequence number of the current, or most recent, round.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.session.parent
    }

    pub fn children(&self) -> Vec<NodeId> {
        let mut children: Vec<_> = self.session.children.iter().copied().collect();
        children.sort_unstable();
        children
    }

    pub fn recorded_clock(&self) -> &[u32] {
        &self.session.recorded
    }

    pub fn markers_sent(&self) -> bool {
        self.session.markers_sent
    }

    pub fn spark(&self) -> bool {
        self.spark
    }

    pub fn set_spark(&mut self, spark: bool) {
        self.spark = spark;
    }

    /// Coordinator only. Records `clock` and floods the first marker of a new
    /// round to every neighbor.
    pub fn begin_round(&mut self, clock: &[u32], out: &mut Vec<Effect>) {
        if !self.is_coordinator() {
            warn!("only the coordinator starts snapshot rounds");
            return;
        }
        if self.is_active() {
            warn!("snapshot round {} is still active, not starting another", self.seq);
            return;
        }
        self.session = Session {
            recorded: clock.to_vec(),
            spark: std::mem::take(&mut self.spark),
            ..Session::default()
        };
        self.seq += 1;
        self.phase = Phase::AwaitingNeighborResponses;
        info!("snapshot round {} started, spark {}", self.seq, self.session.spark);

        for &nb in &self.neighbors {
            debug!("sending initial marker {} to node {}", self.seq, nb);
            out.push(Effect::Send(ServiceMessage::control(
                MessageKind::Marker,
                self.id,
                nb,
                self.seq,
                self.session.spark,
            )));
        }
        self.session.markers_sent = true;
    }

    pub fn on_marker(
        &mut self,
        from: NodeId,
        msg: &ServiceMessage,
        clock: &[u32],
        out: &mut Vec<Effect>,
    ) {
        let seq = msg.header.snap_no;

        if self.is_active() && seq == self.seq {
            // A marker crossing ours on a non-tree edge. Its sender already has
            // a parent, so the edge answers for itself.
            debug!("marker {} from node {} is not our first, NACK", seq, from);
            self.session.responded.insert(from);
            self.reply(MessageKind::MarkerNack, from, out);
            return;
        }

        if seq <= self.seq {
            warn!("ignoring stale marker {} from node {} (current round {})", seq, from, self.seq);
            return;
        }

        if self.is_coordinator() {
            warn!("ignoring marker {} from node {}: rounds only start here", seq, from);
            return;
        }

        if self.is_active() {
            warn!(
                "marker {} from node {} arrived while round {} was unfinished, abandoning it",
                seq, from, self.seq
            );
            self.reset();
        }

        self.seq = seq;
        self.phase = Phase::AwaitingNeighborResponses;
        self.session = Session {
            recorded: clock.to_vec(),
            parent: Some(from),
            spark: std::mem::take(&mut self.spark),
            ..Session::default()
        };
        self.session.responded.insert(from);
        debug!("recorded clock {:?} for round {}, parent is node {}", clock, seq, from);

        for &nb in self.neighbors.iter().filter(|&&nb| nb != from) {
            debug!("forwarding marker {} to node {}", seq, nb);
            out.push(Effect::Send(ServiceMessage::control(
                MessageKind::Marker,
                self.id,
                nb,
                seq,
                self.session.spark,
            )));
        }
        self.session.markers_sent = true;
        self.reply(MessageKind::MarkerAck, from, out);
    }

    /// `from` took our marker as its first, so it is one of our children.
    pub fn on_ack(&mut self, from: NodeId, msg: &ServiceMessage) {
        if !self.accepts(MessageKind::MarkerAck, from, msg) {
            return;
        }
        if self.session.parent == Some(from) {
            warn!("parent node {} acknowledged a marker we never sent it", from);
            return;
        }
        debug!("node {} acknowledged marker {}, adopting it as a child", from, msg.header.snap_no);
        self.session.responded.insert(from);
        self.session.children.insert(from);
    }

    /// `from` already had a parent when our marker reached it.
    pub fn on_nack(&mut self, from: NodeId, msg: &ServiceMessage) {
        if !self.accepts(MessageKind::MarkerNack, from, msg) {
            return;
        }
        debug!("node {} declined marker {}", from, msg.header.snap_no);
        self.session.responded.insert(from);
    }

    pub fn on_ccast(&mut self, from: NodeId, msg: &ServiceMessage, out: &mut Vec<Effect>) {
        if !self.accepts(MessageKind::Ccast, from, msg) {
            return;
        }
        let src = msg.header.src;
        let clock = match &msg.clock {
            Some(clock) => clock,
            None => {
                warn!("CCAST for node {} from node {} carried no clock, ignoring it", src, from);
                return;
            }
        };
        if !self.session.children.contains(&from) {
            warn!("CCAST for node {} arrived from node {} which is not a child", src, from);
        }
        if src == from {
            self.session.finished_children.insert(from);
        }

        if self.is_coordinator() {
            if src == self.id || src as usize >= self.node_count {
                warn!("CCAST names node {} which can't report to this coordinator", src);
                return;
            }
            debug!("collected clock of node {} via node {} (spark {})", src, from, msg.spark());
            if self.session.rows.insert(src, clock.clone()).is_some() {
                warn!("node {} reported twice in round {}", src, self.seq);
            }
        } else if let Some(parent) = self.session.parent {
            debug!("relaying CCAST of node {} from node {} to parent {}", src, from, parent);
            out.push(Effect::Send(msg.readdressed(parent)));
        }
    }

    /// Passes termination on to every neighbor but the one it came from.
    pub fn on_term(
        &mut self,
        from: NodeId,
        msg: &ServiceMessage,
        out: &mut Vec<Effect>,
    ) -> Option<RoundOutcome> {
        if self.is_coordinator() {
            debug!("ignoring termination echoed back by node {}", from);
            return None;
        }
        let seq = msg.header.snap_no;
        for &nb in self.neighbors.iter().filter(|&&nb| nb != from) {
            out.push(Effect::Send(ServiceMessage::control(
                MessageKind::MarkerTerm,
                self.id,
                nb,
                seq,
                false,
            )));
        }
        info!("termination received from node {}", from);
        self.reset();
        self.seq = seq;
        Some(RoundOutcome::Terminated { seq })
    }

    /// Advances the round as far as the messages seen so far allow. Called
    /// after every event the dispatcher handles.
    pub fn poll(&mut self, out: &mut Vec<Effect>) -> Option<RoundOutcome> {
        if self.phase == Phase::AwaitingNeighborResponses && self.all_responded() {
            debug!("every neighbor answered marker {}, children {:?}", self.seq, self.children());
            self.phase = Phase::AwaitingChildCcasts;
        }
        if self.phase != Phase::AwaitingChildCcasts {
            return None;
        }

        if self.is_coordinator() {
            if self.session.rows.len() + 1 < self.node_count {
                return None;
            }
            self.phase = Phase::Aggregating;
            Some(self.aggregate(out))
        } else {
            let session = &self.session;
            if !session.children.iter().all(|c| session.finished_children.contains(c)) {
                return None;
            }
            Some(self.converge(out))
        }
    }

    fn converge(&mut self, out: &mut Vec<Effect>) -> RoundOutcome {
        let seq = self.seq;
        if let Some(parent) = self.session.parent {
            info!(
                "round {} done, sending own CCAST to parent {}, children {:?}",
                seq,
                parent,
                self.children()
            );
            out.push(Effect::Send(
                ServiceMessage::control(
                    MessageKind::Ccast,
                    self.id,
                    parent,
                    seq,
                    self.session.spark,
                )
                .with_clock(self.session.recorded.clone()),
            ));
        }
        out.push(Effect::Persist(self.record(None, None)));
        self.reset();
        RoundOutcome::Completed { seq }
    }

    fn aggregate(&mut self, out: &mut Vec<Effect>) -> RoundOutcome {
        let seq = self.seq;
        let n = self.node_count;
        self.session.rows.insert(self.id, self.session.recorded.clone());

        let rows = (0..n as NodeId)
            .map(|i| {
                let mut row = self.session.rows.remove(&i).unwrap_or_default();
                row.resize(n, 0);
                row
            })
            .collect();
        let matrix = SnapshotMatrix { rows };
        debug!("snapshot {} matrix:\n{}", seq, matrix);

        let violations = matrix.violations();
        for (i, j) in &violations {
            warn!(
                "snapshot {} is inconsistent: node {} saw {} events of node {} \
                 which recorded only {}",
                seq, i, matrix.rows[*i][*j], j, matrix.rows[*j][*j]
            );
        }
        let consistent = violations.is_empty();
        if consistent {
            info!("a consistent snapshot has been determined for round {}", seq);
        }
        out.push(Effect::Persist(self.record(Some(matrix), Some(consistent))));

        if !self.session.spark {
            let term_seq = seq + 1;
            info!("termination determined in round {}", seq);
            for &nb in &self.neighbors {
                out.push(Effect::Send(ServiceMessage::control(
                    MessageKind::MarkerTerm,
                    self.id,
                    nb,
                    term_seq,
                    false,
                )));
            }
            self.reset();
            self.seq = term_seq;
            return RoundOutcome::Terminated { seq: term_seq };
        }

        info!("snapshot round {} ended", seq);
        self.reset();
        RoundOutcome::Completed { seq }
    }

    fn record(
        &self,
        matrix: Option<SnapshotMatrix>,
        consistent: Option<bool>,
    ) -> SnapshotRecord {
        SnapshotRecord {
            node: self.id,
            seq: self.seq,
            taken_at_micros: Utc::now().timestamp_micros(),
            clock: self.session.recorded.clone(),
            spark: self.session.spark,
            matrix,
            consistent,
        }
    }

    fn reply(&self, kind: MessageKind, to: NodeId, out: &mut Vec<Effect>) {
        out.push(Effect::Send(ServiceMessage::control(
            kind,
            self.id,
            to,
            self.seq,
            self.session.spark,
        )));
    }

    /// Whether a round message belongs to the round in progress.
    fn accepts(&self, kind: MessageKind, from: NodeId, msg: &ServiceMessage) -> bool {
        if self.is_active() && msg.header.snap_no == self.seq {
            return true;
        }
        warn!(
            "ignoring {:?} {} from node {} (round {}, active {})",
            kind,
            msg.header.snap_no,
            from,
            self.seq,
            self.is_active()
        );
        false
    }

    fn all_responded(&self) -> bool {
        self.neighbors
            .iter()
            .all(|nb| self.session.responded.contains(nb))
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.session = Session::default();
    }
}
