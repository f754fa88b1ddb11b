use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use super::error::Error;
use crate::service::NodeId;

/// Every header starts with these bits. A header that doesn't is a sign the
/// link has lost frame alignment.
pub const SYNC_BITS: u32 = 0xAAAA_AAAA;

/// sync | kind | src | dst | clock_size | data_size | snap_no | spark
pub const HEADER_LEN: usize = 8 * 4;

/// Largest clock or data payload a receiver will allocate for.
pub const MAX_PAYLOAD_BYTES: u32 = 16 * 1024 * 1024;

/// Bytes taken by one vector clock entry on the wire.
pub const CLOCK_ENTRY_LEN: usize = 4;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Application payload stamped with the sender's vector clock
    Application = 0,
    /// Snapshot round marker, flooded from the coordinator
    Marker = 1,
    /// Reply to a marker that was the receiver's first of the round
    MarkerAck = 2,
    /// Reply to any other marker
    MarkerNack = 3,
    /// A recorded round clock travelling up the spanning tree
    Ccast = 4,
    /// Global termination, flooded from the coordinator
    MarkerTerm = 5,
}

impl TryFrom<u32> for MessageKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Application,
            1 => Self::Marker,
            2 => Self::MarkerAck,
            3 => Self::MarkerNack,
            4 => Self::Ccast,
            5 => Self::MarkerTerm,
            other => Err(Error::UnknownMessageKind(other))?,
        })
    }
}

/// The fixed-size envelope written ahead of every message on a link. Payload
/// sizes come first so the receiver knows how much more to read once the kind
/// has been decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceHeader {
    pub kind: MessageKind,
    pub src: NodeId,
    pub dst: NodeId,
    pub clock_size: u32,
    pub data_size: u32,
    pub snap_no: u32,
    /// 1 while the sender's application still has work to do
    pub spark: u32,
}

impl ServiceHeader {
    pub fn new(kind: MessageKind, src: NodeId, dst: NodeId, snap_no: u32) -> Self {
        Self {
            kind,
            src,
            dst,
            clock_size: 0,
            data_size: 0,
            snap_no,
            spark: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32_into(
            &[
                SYNC_BITS,
                self.kind as u32,
                self.src,
                self.dst,
                self.clock_size,
                self.data_size,
                self.snap_no,
                self.spark,
            ],
            &mut buf,
        );
        buf
    }

    /// Number of payload bytes that follow a header whose sync bits are
    /// intact, even if the rest of it fails to decode. A receiver skips this
    /// many bytes to drop the frame without losing alignment.
    pub fn payload_len(buf: &[u8; HEADER_LEN]) -> Result<u64, Error> {
        check_sync(buf)?;
        let clock_size = LittleEndian::read_u32(array_ref![buf, 16, 4]);
        let data_size = LittleEndian::read_u32(array_ref![buf, 20, 4]);
        Ok(clock_size as u64 + data_size as u64)
    }

    /// Decodes a header, checking the sync bits before anything else so a
    /// misaligned read is never mistaken for a real message.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        check_sync(buf)?;
        let mut fields = [0u32; HEADER_LEN / 4 - 1];
        LittleEndian::read_u32_into(&buf[4..], &mut fields);
        let [kind, src, dst, clock_size, data_size, snap_no, spark] = fields;

        for len in [clock_size, data_size] {
            if len > MAX_PAYLOAD_BYTES {
                Err(Error::PayloadTooLarge { len })?
            }
        }
        if clock_size as usize % CLOCK_ENTRY_LEN != 0 {
            Err(Error::MisalignedClockPayload { len: clock_size })?
        }

        Ok(Self {
            kind: MessageKind::try_from(kind)?,
            src,
            dst,
            clock_size,
            data_size,
            snap_no,
            spark,
        })
    }
}

fn check_sync(buf: &[u8; HEADER_LEN]) -> Result<(), Error> {
    let sync = u32::from_le_bytes(*array_ref![buf, 0, 4]);
    if sync != SYNC_BITS {
        Err(Error::Desynchronized { found: sync })?
    }
    Ok(())
}

/// A header plus its optional payloads. Absent payloads are `None` rather
/// than empty buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceMessage {
    pub header: ServiceHeader,
    pub clock: Option<Vec<u32>>,
    pub data: Option<Vec<u8>>,
}

impl ServiceMessage {
    /// A message with no payloads. Used for every control kind except CCAST.
    pub fn control(
        kind: MessageKind,
        src: NodeId,
        dst: NodeId,
        snap_no: u32,
        spark: bool,
    ) -> Self {
        let mut header = ServiceHeader::new(kind, src, dst, snap_no);
        header.spark = spark as u32;
        Self {
            header,
            clock: None,
            data: None,
        }
    }

    pub fn with_clock(mut self, clock: Vec<u32>) -> Self {
        self.header.clock_size = (clock.len() * CLOCK_ENTRY_LEN) as u32;
        self.clock = if clock.is_empty() { None } else { Some(clock) };
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.header.data_size = data.len() as u32;
        self.data = if data.is_empty() { None } else { Some(data) };
        self
    }

    /// Returns a copy addressed to a different neighbor.
    pub fn readdressed(&self, dst: NodeId) -> Self {
        let mut msg = self.clone();
        msg.header.dst = dst;
        msg
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn spark(&self) -> bool {
        self.header.spark != 0
    }

    /// header | clock | data, ready to be written to a link in one go.
    pub fn encode(&self) -> Vec<u8> {
        let clock_len = self.header.clock_size as usize;
        let data_len = self.header.data_size as usize;
        let mut buf = Vec::with_capacity(HEADER_LEN + clock_len + data_len);
        buf.extend_from_slice(&self.header.encode());
        if let Some(clock) = &self.clock {
            let start = buf.len();
            buf.resize(start + clock.len() * CLOCK_ENTRY_LEN, 0);
            LittleEndian::write_u32_into(clock, &mut buf[start..]);
        }
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        buf
    }
}

/// Decodes a clock payload read off a link.
pub fn decode_clock(buf: &[u8]) -> Vec<u32> {
    let mut clock = vec![0u32; buf.len() / CLOCK_ENTRY_LEN];
    LittleEndian::read_u32_into(&buf[..clock.len() * CLOCK_ENTRY_LEN], &mut clock);
    clock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eight_words() {
        let header = ServiceHeader::new(MessageKind::Marker, 0, 1, 7);
        let buf = header.encode();
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[0..4], &[0xAA; 4]);
        assert_eq!(LittleEndian::read_u32(&buf[4..8]), 1);
        assert_eq!(LittleEndian::read_u32(&buf[24..28]), 7);
    }

    #[test]
    fn decode_rejects_bad_sync() {
        let mut buf = ServiceHeader::new(MessageKind::Marker, 0, 1, 1).encode();
        buf[0] = 0x55;
        match ServiceHeader::decode(&buf) {
            Err(Error::Desynchronized { found }) => {
                assert_eq!(found, 0xAAAA_AA55)
            }
            other => panic!("expected desync, got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut buf = ServiceHeader::new(MessageKind::Marker, 0, 1, 1).encode();
        LittleEndian::write_u32(&mut buf[4..8], 42);
        assert!(matches!(
            ServiceHeader::decode(&buf),
            Err(Error::UnknownMessageKind(42))
        ));
    }

    #[test]
    fn decode_rejects_partial_clock_entries() {
        let mut header = ServiceHeader::new(MessageKind::Ccast, 2, 1, 1);
        header.clock_size = 6;
        assert!(matches!(
            ServiceHeader::decode(&header.encode()),
            Err(Error::MisalignedClockPayload { len: 6 })
        ));
    }

    #[test]
    fn decode_rejects_oversized_payloads() {
        let mut header = ServiceHeader::new(MessageKind::Application, 2, 1, 0);
        header.data_size = MAX_PAYLOAD_BYTES + 1;
        assert!(matches!(
            ServiceHeader::decode(&header.encode()),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn payload_len_survives_a_bad_kind_but_not_a_bad_sync() {
        let mut header = ServiceHeader::new(MessageKind::Ccast, 2, 1, 1);
        header.clock_size = 12;
        header.data_size = MAX_PAYLOAD_BYTES + 1;
        let mut buf = header.encode();
        LittleEndian::write_u32(&mut buf[4..8], 42);
        assert_eq!(
            ServiceHeader::payload_len(&buf).unwrap(),
            12 + MAX_PAYLOAD_BYTES as u64 + 1
        );

        buf[0] = 0;
        assert!(matches!(
            ServiceHeader::payload_len(&buf),
            Err(Error::Desynchronized { .. })
        ));
    }

    #[test]
    fn encoded_message_carries_payloads_after_header() {
        let msg = ServiceMessage::control(MessageKind::Application, 1, 2, 0, false)
            .with_clock(vec![3, 4, 5])
            .with_data(b"hi".to_vec());
        let buf = msg.encode();
        assert_eq!(buf.len(), HEADER_LEN + 12 + 2);
        assert_eq!(decode_clock(&buf[HEADER_LEN..HEADER_LEN + 12]), vec![3, 4, 5]);
        assert_eq!(&buf[HEADER_LEN + 12..], b"hi");

        let header = ServiceHeader::decode(array_ref![buf, 0, HEADER_LEN]).unwrap();
        assert_eq!(header, msg.header);
    }

    #[test]
    fn empty_payloads_stay_absent() {
        let msg = ServiceMessage::control(MessageKind::Ccast, 1, 0, 3, true)
            .with_clock(vec![])
            .with_data(vec![]);
        assert!(msg.clock.is_none());
        assert!(msg.data.is_none());
        assert!(msg.spark());
        assert_eq!(msg.encode().len(), HEADER_LEN);
    }
}
