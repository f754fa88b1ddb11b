use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    error::Error,
    wire::{decode_clock, ServiceHeader, ServiceMessage, HEADER_LEN},
};
use crate::service::NodeId;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Links are ordered, reliable byte channels between two neighboring nodes.
/// The service never looks inside them; all it needs is somewhere to read
/// frames from and somewhere to write them to.
pub struct Link {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Builds a link over a single duplex stream such as a TCP or Unix socket.
    pub fn split<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = io::split(stream);
        Self::new(reader, writer)
    }

    /// Two connected in-memory link ends. Whatever is written on one end is
    /// read from the other.
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (a, b) = io::duplex(max_buf_size);
        (Self::split(a), Self::split(b))
    }

    pub(crate) fn into_streams(
        self,
        peer: NodeId,
    ) -> (LinkSendStream, LinkRecvStream) {
        (
            LinkSendStream {
                peer,
                stream: self.writer,
            },
            LinkRecvStream {
                peer,
                stream: self.reader,
            },
        )
    }
}

/// The write half of a link. Only the dispatcher holds these, so writes to a
/// given neighbor are never interleaved.
pub struct LinkSendStream {
    peer: NodeId,
    stream: BoxedWriter,
}

impl LinkSendStream {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Writes the whole frame before returning, so a frame is never split by
    /// another write on the same link.
    pub async fn send(&mut self, msg: &ServiceMessage) -> Result<(), Error> {
        let buf = msg.encode();
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

pub struct LinkRecvStream {
    peer: NodeId,
    stream: BoxedReader,
}

impl LinkRecvStream {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Reads the next frame: header, then the clock payload, then the data
    /// payload. A header with bad sync bits is consumed alone. Any other
    /// header that fails to decode has its payloads skipped as well, so the
    /// next read starts on the next frame.
    pub async fn recv(&mut self) -> Result<ServiceMessage, Error> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header_buf).await?;
        let payload_len = ServiceHeader::payload_len(&header_buf)?;
        let header = match ServiceHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                self.skip(payload_len).await?;
                return Err(e);
            }
        };

        let clock = if header.clock_size > 0 {
            let mut buf = vec![0u8; header.clock_size as usize];
            self.stream.read_exact(&mut buf).await?;
            Some(decode_clock(&buf))
        } else {
            None
        };

        let data = if header.data_size > 0 {
            let mut buf = vec![0u8; header.data_size as usize];
            self.stream.read_exact(&mut buf).await?;
            Some(buf)
        } else {
            None
        };

        Ok(ServiceMessage {
            header,
            clock,
            data,
        })
    }

    async fn skip(&mut self, len: u64) -> Result<(), Error> {
        let skipped = io::copy(&mut (&mut self.stream).take(len), &mut io::sink()).await?;
        if skipped < len {
            Err(Error::LinkClosed)?
        }
        trace!("skipped {} payload bytes of a dropped frame", skipped);
        Ok(())
    }
}

/// Reads frames off one neighbor's link for as long as the link is open and
/// hands every decoded message to the dispatcher, tagged with the neighbor it
/// arrived from. Never touches protocol state.
pub struct LinkReceiver {
    node: NodeId,
    stream: LinkRecvStream,
    dispatcher_tx: mpsc::UnboundedSender<(NodeId, ServiceMessage)>,
}

impl LinkReceiver {
    pub fn new(
        node: NodeId,
        stream: LinkRecvStream,
        dispatcher_tx: mpsc::UnboundedSender<(NodeId, ServiceMessage)>,
    ) -> Self {
        Self {
            node,
            stream,
            dispatcher_tx,
        }
    }

    pub async fn run(mut self) {
        let peer = self.stream.peer();
        let span = debug_span!("link", node = self.node, peer = peer);
        async move {
            debug!("receiver started");
            loop {
                match self.stream.recv().await {
                    Ok(msg) => {
                        trace!(kind = ?msg.kind(), snap_no = msg.header.snap_no, "received frame");
                        if self.dispatcher_tx.send((peer, msg)).is_err() {
                            debug!("dispatcher gone, receiver stopping");
                            return;
                        }
                    }
                    Err(Error::LinkClosed) => {
                        debug!("link closed, receiver stopping");
                        return;
                    }
                    Err(e) if e.is_framing() => {
                        warn!("dropping illegal frame from neighbor {}: {}", peer, e);
                    }
                    Err(e) => {
                        warn!("receiver for neighbor {} stopping: {}", peer, e);
                        return;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
