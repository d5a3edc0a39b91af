use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ack_set::AckSet;
use crate::message::{Message, MessageKind, UnreliableId};
use crate::sequence_number::SequenceNumber;

/// Shared bookkeeping for every message a node currently has in flight,
/// whether locally originated or relayed for another node.
///
/// The registry assigns sequence numbers, deduplicates message references
/// across transmit queues (reliable and forwarded messages by
/// `(source, sequence number)`, locally originated unreliable messages
/// additionally by their caller-supplied id), and drops its bookkeeping when
/// the last queue lets go of a message.
///
/// It only ever holds weak references - the transmit queues own the messages.
pub struct OutboundMessages {
    node_id: Uuid,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    next_sequence_number: SequenceNumber,
    by_sequence: FxHashMap<(Uuid, SequenceNumber), Weak<Message>>,
    by_unreliable_id: FxHashMap<UnreliableId, Weak<Message>>,
}

impl OutboundMessages {
    pub fn new(node_id: Uuid) -> OutboundMessages {
        OutboundMessages {
            node_id,
            inner: Mutex::new(RegistryInner {
                next_sequence_number: SequenceNumber::ZERO,
                by_sequence: FxHashMap::default(),
                by_unreliable_id: FxHashMap::default(),
            }),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Registers a new reliable broadcast, assigning it the next sequence
    /// number of this node.
    pub fn add_reliable(&self, payload: &[u8], targets: BTreeSet<Uuid>) -> Arc<Message> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let sequence_number = inner.take_sequence_number();
        let message = Arc::new(Message::new(
            self.node_id,
            sequence_number,
            MessageKind::Reliable,
            None,
            payload,
            targets,
        ));

        trace!("registered reliable message {} from {}", sequence_number, self.node_id);
        inner.by_sequence.insert((self.node_id, sequence_number), Arc::downgrade(&message));
        message
    }

    /// Registers an unreliable broadcast, or returns the message already in
    /// flight under the same id. The second element is false for a coalesced
    /// repeat (it is already queued everywhere it needs to be).
    pub fn add_unreliable(
        &self,
        id: UnreliableId,
        payload: &[u8],
        targets: BTreeSet<Uuid>,
    ) -> (Arc<Message>, bool) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if let Some(existing) = inner.by_unreliable_id.get(&id).and_then(Weak::upgrade) {
            trace!("coalescing unreliable broadcast onto live message with id {}", id);
            return (existing, false);
        }

        let sequence_number = inner.take_sequence_number();
        let message = Arc::new(Message::new(
            self.node_id,
            sequence_number,
            MessageKind::Unreliable,
            Some(id),
            payload,
            targets,
        ));

        trace!("registered unreliable message {} from {} with id {}", sequence_number, self.node_id, id);
        inner.by_sequence.insert((self.node_id, sequence_number), Arc::downgrade(&message));
        inner.by_unreliable_id.insert(id, Arc::downgrade(&message));
        (message, true)
    }

    /// Registers a message being relayed on behalf of `source`, or returns
    /// the live copy if one is already in flight for `(source, sn)`.
    pub fn add_forwarded(
        &self,
        source: Uuid,
        sequence_number: SequenceNumber,
        kind: MessageKind,
        inner_bytes: Bytes,
        targets: BTreeSet<Uuid>,
    ) -> (Arc<Message>, bool) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if let Some(existing) = inner.by_sequence.get(&(source, sequence_number)).and_then(Weak::upgrade) {
            return (existing, false);
        }

        let message = Arc::new(Message::forwarded(source, sequence_number, kind, inner_bytes, targets));
        inner.by_sequence.insert((source, sequence_number), Arc::downgrade(&message));
        (message, true)
    }

    /// A transmit queue no longer needs `message`. Once the last queue lets
    /// go, the registry entries are dropped with it. Idempotent.
    pub fn release(&self, message: Arc<Message>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if Arc::strong_count(&message) > 1 {
            // some other queue still holds it
            return;
        }

        trace!("releasing message {} from {}", message.sequence_number(), message.source());
        inner.by_sequence.remove(&(message.source(), message.sequence_number()));
        if let Some(id) = message.coalesce_id() {
            inner.by_unreliable_id.remove(&id);
        }
    }

    /// `acker` has confirmed receipt of the given window of `source`'s
    /// sequence numbers. Removes `acker` from the target set of every live
    /// message the window accounts for; acknowledgements for unknown
    /// messages are ignored.
    ///
    /// The window is cumulative: the receive side never lets an
    /// unacknowledged slot slide out, so everything below it counts as
    /// acknowledged too.
    ///
    /// Returns true if any target was dropped (the transmit queues then have
    /// pruning to do).
    pub fn on_ack_set(&self, acker: Uuid, source: Uuid, acks: &AckSet) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let mut any_removed = false;
        let mut dead_keys = Vec::new();

        for (key, weak) in inner.by_sequence.iter() {
            if key.0 != source {
                continue;
            }
            let Some(message) = weak.upgrade() else {
                dead_keys.push(*key);
                continue;
            };
            if acks.contains(key.1) {
                let now_empty = message.remove_target(&acker);
                any_removed = true;
                if now_empty && message.is_reliable() {
                    debug!("reliable message {} from {} acknowledged by all targets", key.1, source);
                }
            }
        }

        for key in dead_keys {
            inner.by_sequence.remove(&key);
        }

        any_removed
    }
}

impl RegistryInner {
    fn take_sequence_number(&mut self) -> SequenceNumber {
        let sn = self.next_sequence_number;
        self.next_sequence_number = sn.next();
        sn
    }
}
