use std::{fmt, io};

use super::wire::MAX_PAYLOAD_BYTES;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// The peer closed its end of the link.
    LinkClosed,
    /// A header arrived whose sync bits didn't match [`SYNC_BITS`](super::wire::SYNC_BITS).
    Desynchronized { found: u32 },
    UnknownMessageKind(u32),
    UnknownApplicationKind(u32),
    PayloadTooLarge { len: u32 },
    MisalignedClockPayload { len: u32 },
    CouldNotEncodeSnapshot,
    CouldNotDecodeSnapshot,
    SnapshotDigestMismatch,
    InvalidConfig(String),
    AlreadyStarted,
    DispatcherStopped,
}

impl Error {
    /// Framing errors are local to a single frame. The receiver drops the
    /// frame and keeps reading from the link.
    pub fn is_framing(&self) -> bool {
        match self {
            Error::Desynchronized { .. }
            | Error::UnknownMessageKind(_)
            | Error::PayloadTooLarge { .. }
            | Error::MisalignedClockPayload { .. } => true,
            Error::Io(e) => e.kind() != io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::LinkClosed
        } else {
            Self::Io(e)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::LinkClosed => write!(f, "link closed by peer"),
            Error::Desynchronized { found } => {
                write!(f, "bad sync bits {:#010x}", found)
            }
            Error::UnknownMessageKind(kind) => {
                write!(f, "unknown service message kind {}", kind)
            }
            Error::UnknownApplicationKind(kind) => {
                write!(f, "unknown application message kind {}", kind)
            }
            Error::PayloadTooLarge { len } => write!(
                f,
                "payload of {} bytes exceeds the {} byte limit",
                len, MAX_PAYLOAD_BYTES
            ),
            Error::MisalignedClockPayload { len } => {
                write!(f, "clock payload of {} bytes is not a whole clock", len)
            }
            Error::CouldNotEncodeSnapshot => {
                write!(f, "could not archive snapshot record")
            }
            Error::CouldNotDecodeSnapshot => {
                write!(f, "could not decode snapshot record")
            }
            Error::SnapshotDigestMismatch => {
                write!(f, "snapshot record digest does not match its contents")
            }
            Error::InvalidConfig(reason) => {
                write!(f, "invalid node config: {}", reason)
            }
            Error::AlreadyStarted => write!(f, "service already started"),
            Error::DispatcherStopped => {
                write!(f, "dispatcher stopped unexpectedly")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}
