use tokio::sync::mpsc;

use super::{net::Error, NodeId};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationKind {
    /// Service asks the application whether it still has work
    StateQuery = 0,
    /// Application reports its liveness in `state`
    StateReply = 1,
    /// A payload travelling between the application and a neighbor
    Message = 2,
}

impl TryFrom<u32> for ApplicationKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::StateQuery,
            1 => Self::StateReply,
            2 => Self::Message,
            other => Err(Error::UnknownApplicationKind(other))?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationHeader {
    pub kind: ApplicationKind,
    pub src: NodeId,
    pub dst: NodeId,
    pub data_size: u32,
    /// On `StateReply`, 1 while the application still has pending work.
    pub state: u32,
}

/// What crosses the boundary between the service and the application above
/// it. The service never interprets `data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub header: ApplicationHeader,
    pub data: Option<Vec<u8>>,
}

impl ApplicationMessage {
    pub fn state_query(node: NodeId) -> Self {
        Self {
            header: ApplicationHeader {
                kind: ApplicationKind::StateQuery,
                src: node,
                dst: node,
                data_size: 0,
                state: 0,
            },
            data: None,
        }
    }

    pub fn state_reply(node: NodeId, pending_work: bool) -> Self {
        Self {
            header: ApplicationHeader {
                kind: ApplicationKind::StateReply,
                src: node,
                dst: node,
                data_size: 0,
                state: pending_work as u32,
            },
            data: None,
        }
    }

    /// A payload from `src` to `dst`. In the outbound direction `dst` must be
    /// a neighbor of the sending node.
    pub fn message(src: NodeId, dst: NodeId, data: Vec<u8>) -> Self {
        let data_size = data.len() as u32;
        Self {
            header: ApplicationHeader {
                kind: ApplicationKind::Message,
                src,
                dst,
                data_size,
                state: 0,
            },
            data: if data.is_empty() { None } else { Some(data) },
        }
    }

    pub fn kind(&self) -> ApplicationKind {
        self.header.kind
    }
}

/// The application's end of the boundary. `tx` reaches the dispatcher; `rx`
/// yields state queries and delivered messages, and closes once the
/// dispatcher stops.
pub struct ApplicationPort {
    pub tx: mpsc::UnboundedSender<ApplicationMessage>,
    pub rx: mpsc::UnboundedReceiver<ApplicationMessage>,
}

impl ApplicationPort {
    /// Asks the service to deliver `data` to neighbor `dst`.
    pub fn send(&self, src: NodeId, dst: NodeId, data: Vec<u8>) -> Result<(), Error> {
        self.tx
            .send(ApplicationMessage::message(src, dst, data))
            .map_err(|_| Error::DispatcherStopped)
    }

    /// Reports whether the application still has work pending.
    pub fn reply_state(&self, node: NodeId, pending_work: bool) -> Result<(), Error> {
        self.tx
            .send(ApplicationMessage::state_reply(node, pending_work))
            .map_err(|_| Error::DispatcherStopped)
    }

    pub async fn recv(&mut self) -> Option<ApplicationMessage> {
        self.rx.recv().await
    }
}

/// The dispatcher's end of the boundary.
pub(crate) struct ServicePort {
    pub tx: mpsc::UnboundedSender<ApplicationMessage>,
    pub rx: mpsc::UnboundedReceiver<ApplicationMessage>,
}

/// A connected pair of boundary ends.
pub(crate) fn boundary() -> (ServicePort, ApplicationPort) {
    let (to_app_tx, to_app_rx) = mpsc::unbounded_channel();
    let (to_service_tx, to_service_rx) = mpsc::unbounded_channel();
    (
        ServicePort {
            tx: to_app_tx,
            rx: to_service_rx,
        },
        ApplicationPort {
            tx: to_service_tx,
            rx: to_app_rx,
        },
    )
}
