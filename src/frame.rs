use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::TryFromPrimitive;
use tracing::warn;
use uuid::Uuid;

use crate::ack_set::AckSet;
use crate::message::MessageKind;
use crate::safe_converter::PrecheckedCast;
use crate::sequence_number::SequenceNumber;

/// Wire layout of one datagram:
///
/// ```ascii
/// 0: frame count (u16 BE)
/// 2: `frame count` x message frame:
///      source        : 16 bytes
///      target count  : u8
///      targets       : `target count` x 16 bytes, sorted
///      inner header  : kind tag (u8) | sequence number (u32 BE)
///                      | payload length (u16 BE)
///      payload       : `payload length` bytes
/// *: zero or more ack blocks, to the end of the datagram:
///      ack tag       : u8 (0xAC)
///      acker         : 16 bytes
///      source        : 16 bytes
///      highest sn    : u32 BE
///      predecessors  : u32 BE (bit i set => `highest - (i+1)` acked too)
/// ```
///
/// There is no datagram-level checksum - UDP provides one.
pub const ACK_TAG: u8 = 0xac;

pub const FRAME_COUNT_LEN: usize = size_of::<u16>();

const UUID_LEN: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
enum KindTag {
    Reliable = 0,
    Unreliable = 1,
}

impl From<MessageKind> for KindTag {
    fn from(kind: MessageKind) -> KindTag {
        match kind {
            MessageKind::Reliable => KindTag::Reliable,
            MessageKind::Unreliable => KindTag::Unreliable,
        }
    }
}

fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    if buf.remaining() < UUID_LEN {
        bail!("buffer too short for a UUID");
    }
    let mut raw = [0u8; UUID_LEN];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

/// The per-message part of a frame that travels with the payload. It is
/// encoded once by the originating node and copied verbatim by every
/// forwarder.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub sequence_number: SequenceNumber,
    pub payload_len: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u32>() + size_of::<u16>();

    pub fn for_payload(kind: MessageKind, sequence_number: SequenceNumber, payload: &[u8]) -> MessageHeader {
        MessageHeader {
            kind,
            sequence_number,
            payload_len: payload.len().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(KindTag::from(self.kind) as u8);
        buf.put_u32(self.sequence_number.to_raw());
        buf.put_u16(self.payload_len);
    }

    /// `Ok(None)` means the header had an unknown kind tag but was intact
    /// enough to skip over; `Err` means the buffer was truncated.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Option<Self>> {
        let tag = buf.try_get_u8()?;
        let sequence_number = SequenceNumber::from_raw(buf.try_get_u32()?);
        let payload_len = buf.try_get_u16()?;

        let kind = match KindTag::try_from(tag) {
            Ok(KindTag::Reliable) => MessageKind::Reliable,
            Ok(KindTag::Unreliable) => MessageKind::Unreliable,
            Err(_) => return Ok(None),
        };

        Ok(Some(MessageHeader {
            kind,
            sequence_number,
            payload_len,
        }))
    }
}

/// One decoded message frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub source: Uuid,
    pub targets: Vec<Uuid>,
    pub header: MessageHeader,
    /// inner header + payload, as they appeared on the wire
    pub inner: Bytes,
}

impl Frame {
    pub fn payload(&self) -> Bytes {
        self.inner.slice(MessageHeader::SERIALIZED_LEN..)
    }
}

/// Bytes a frame adds around its pre-encoded inner bytes.
pub fn frame_overhead(target_count: usize) -> usize {
    UUID_LEN + size_of::<u8>() + target_count * UUID_LEN
}

/// Encodes one message frame. More than 255 targets in a single frame is a
/// programmer error and fails fast.
pub fn encode_frame(buf: &mut BytesMut, source: &Uuid, targets: &[Uuid], inner: &[u8]) {
    assert!(targets.len() <= u8::MAX as usize, "a frame supports at most 255 targets");

    put_uuid(buf, source);
    buf.put_u8(targets.len().prechecked_cast());
    for target in targets {
        put_uuid(buf, target);
    }
    buf.put_slice(inner);
}

/// A piggy-backed acknowledgement: `acker` confirms having seen the window of
/// `source`'s sequence numbers. Carried whole so forwarders can relay it
/// towards `source` along the reverse path.
#[derive(Clone, Debug)]
pub struct AckBlock {
    pub acker: Uuid,
    pub source: Uuid,
    pub acks: AckSet,
}

impl AckBlock {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>() + 2 * UUID_LEN + size_of::<u32>() + size_of::<u32>();

    pub fn ser(&self, buf: &mut BytesMut) {
        let highest = self.acks.highest()
            .expect("an empty ack window is never put on the wire");

        buf.put_u8(ACK_TAG);
        put_uuid(buf, &self.acker);
        put_uuid(buf, &self.source);
        buf.put_u32(highest.to_raw());
        buf.put_u32(self.acks.predecessors());
    }

    /// Deserializes the block body; the tag byte has already been consumed.
    pub fn deser_body(buf: &mut impl Buf) -> anyhow::Result<AckBlock> {
        let acker = try_get_uuid(buf)?;
        let source = try_get_uuid(buf)?;
        let highest = SequenceNumber::from_raw(buf.try_get_u32()?);
        let predecessors = buf.try_get_u32()?;

        Ok(AckBlock {
            acker,
            source,
            acks: AckSet::from_wire(highest, predecessors),
        })
    }
}

/// Parses one received datagram into message frames and ack blocks.
///
/// A frame with an unknown kind tag is skipped using its length fields; a
/// truncated datagram aborts parsing of whatever remains. In both cases
/// whatever parsed cleanly before the damage is still returned.
pub fn parse_datagram(datagram: Bytes) -> (Vec<Frame>, Vec<AckBlock>) {
    let mut frames = Vec::new();
    let mut acks = Vec::new();
    if let Err(e) = try_parse_datagram(datagram, &mut frames, &mut acks) {
        warn!("received a damaged datagram - dropping its tail: {}", e);
    }
    (frames, acks)
}

fn try_parse_datagram(
    datagram: Bytes,
    frames: &mut Vec<Frame>,
    acks: &mut Vec<AckBlock>,
) -> anyhow::Result<()> {
    let mut buf = datagram.clone();

    let frame_count = TryGetFixedSupport::try_get_u16(&mut buf)?;

    for _ in 0..frame_count {
        let source = try_get_uuid(&mut buf)?;

        let target_count = TryGetFixedSupport::try_get_u8(&mut buf)?;
        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            targets.push(try_get_uuid(&mut buf)?);
        }

        let inner_start = datagram.len() - buf.remaining();
        let tag = TryGetFixedSupport::try_get_u8(&mut buf)?;
        let sequence_number = SequenceNumber::from_raw(TryGetFixedSupport::try_get_u32(&mut buf)?);
        let payload_len = TryGetFixedSupport::try_get_u16(&mut buf)?;

        if buf.remaining() < payload_len as usize {
            bail!("truncated frame payload");
        }
        buf.advance(payload_len as usize);

        let kind = match KindTag::try_from(tag) {
            Ok(KindTag::Reliable) => MessageKind::Reliable,
            Ok(KindTag::Unreliable) => MessageKind::Unreliable,
            Err(_) => {
                warn!("frame from {} has an unknown kind tag {:#x} - skipping", source, tag);
                continue;
            }
        };
        let header = MessageHeader {
            kind,
            sequence_number,
            payload_len,
        };

        let inner_end = datagram.len() - buf.remaining();
        frames.push(Frame {
            source,
            targets,
            header,
            inner: datagram.slice(inner_start..inner_end),
        });
    }

    while buf.has_remaining() {
        let tag = TryGetFixedSupport::try_get_u8(&mut buf)?;
        if tag != ACK_TAG {
            warn!("unexpected trailing tag {:#x} in datagram - ignoring the rest", tag);
            break;
        }
        acks.push(AckBlock::deser_body(&mut buf)?);
    }

    Ok(())
}
