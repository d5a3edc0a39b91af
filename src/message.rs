use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::frame::MessageHeader;
use crate::sequence_number::SequenceNumber;

/// Caller-supplied coalescing key for unreliable broadcasts, typically a hash
/// of the payload. Repeated broadcasts with the same id collapse onto one
/// in-flight message.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UnreliableId(u64);

impl UnreliableId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

impl Display for UnreliableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageKind {
    Reliable,
    Unreliable,
}

/// One broadcast payload in flight.
///
/// The bytes are pre-encoded (inner header + payload) so every transmit queue
/// can copy them into a datagram verbatim. The target set is the mutable part:
/// it holds the nodes that still owe an acknowledgement (reliable) or have not
/// been sent the bytes yet (unreliable). A reliable message may be released
/// only once the target set is empty.
pub struct Message {
    source: Uuid,
    sequence_number: SequenceNumber,
    kind: MessageKind,
    coalesce_id: Option<UnreliableId>,
    bytes: Bytes,
    targets: Mutex<BTreeSet<Uuid>>,
}

impl Message {
    pub fn new(
        source: Uuid,
        sequence_number: SequenceNumber,
        kind: MessageKind,
        coalesce_id: Option<UnreliableId>,
        payload: &[u8],
        targets: BTreeSet<Uuid>,
    ) -> Message {
        let mut bytes = BytesMut::with_capacity(MessageHeader::SERIALIZED_LEN + payload.len());
        MessageHeader::for_payload(kind, sequence_number, payload).ser(&mut bytes);
        bytes.put_slice(payload);

        Message {
            source,
            sequence_number,
            kind,
            coalesce_id,
            bytes: bytes.freeze(),
            targets: Mutex::new(targets),
        }
    }

    /// A message being relayed on behalf of another node: its bytes arrive
    /// pre-encoded off the wire and are carried forward untouched.
    pub fn forwarded(
        source: Uuid,
        sequence_number: SequenceNumber,
        kind: MessageKind,
        bytes: Bytes,
        targets: BTreeSet<Uuid>,
    ) -> Message {
        Message {
            source,
            sequence_number,
            kind,
            coalesce_id: None,
            bytes,
            targets: Mutex::new(targets),
        }
    }

    pub fn source(&self) -> Uuid {
        self.source
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn coalesce_id(&self) -> Option<UnreliableId> {
        self.coalesce_id
    }

    pub fn is_reliable(&self) -> bool {
        self.kind == MessageKind::Reliable
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Writes `targets ∩ other` into `out`, sorted (the target set is itself
    /// sorted, so the intersection comes out sorted for free).
    pub fn intersect_targets_into(&self, other: &BTreeSet<Uuid>, out: &mut Vec<Uuid>) {
        out.clear();
        let targets = self.targets.lock().expect("target set lock poisoned");
        out.extend(targets.intersection(other).cloned());
    }

    /// Removes every element of `other` from the target set; returns true if
    /// the set is empty afterwards.
    pub fn remove_targets(&self, other: &BTreeSet<Uuid>) -> bool {
        let mut targets = self.targets.lock().expect("target set lock poisoned");
        for id in other {
            targets.remove(id);
        }
        targets.is_empty()
    }

    /// True iff the target set and `other` intersect.
    pub fn has_any_target_in(&self, other: &BTreeSet<Uuid>) -> bool {
        let targets = self.targets.lock().expect("target set lock poisoned");
        targets.iter().any(|t| other.contains(t))
    }

    /// Removes a single target; returns true if the set is empty afterwards.
    pub fn remove_target(&self, id: &Uuid) -> bool {
        let mut targets = self.targets.lock().expect("target set lock poisoned");
        targets.remove(id);
        targets.is_empty()
    }

    pub fn targets_is_empty(&self) -> bool {
        self.targets.lock().expect("target set lock poisoned").is_empty()
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message{{source:{}, sn:{}, kind:{:?}, len:{}}}",
            self.source,
            self.sequence_number,
            self.kind,
            self.bytes.len(),
        )
    }
}
