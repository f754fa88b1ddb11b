pub mod error;
pub mod link;
pub mod wire;

pub use error::Error;
pub use link::{Link, LinkReceiver, LinkRecvStream, LinkSendStream};
pub use wire::{MessageKind, ServiceHeader, ServiceMessage, SYNC_BITS};
