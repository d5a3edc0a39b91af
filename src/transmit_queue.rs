use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::trace;
use uuid::Uuid;

use crate::encoder::DatagramEncoder;
use crate::frame;
use crate::message::Message;
use crate::outbound_messages::OutboundMessages;

/// The outbound side of one link: selects which messages go into the next
/// datagram for that link's neighbour.
///
/// Messages are shared with other queues through the registry; this queue
/// only ever sends to the subset of a message's targets that are reachable
/// through its link (`remote_targets`). Reliable messages stay queued until
/// acknowledgement processing empties their target set; unreliable messages
/// are emitted once per target and dropped.
pub struct TransmitQueue {
    outbound: Arc<OutboundMessages>,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    /// nodes reachable through this link: the direct neighbour plus any
    /// forward-routed peers added via `add_target`
    remote_targets: BTreeSet<Uuid>,

    // Invariant: messages.is_empty() <=> cursor == 0 && there is nothing to
    // point at; otherwise cursor < messages.len()
    messages: VecDeque<Arc<Message>>,
    cursor: usize,

    // scratch vector for target intersections, reused across calls
    target_intersection: Vec<Uuid>,
}

impl TransmitQueue {
    pub fn new(outbound: Arc<OutboundMessages>) -> TransmitQueue {
        TransmitQueue {
            outbound,
            inner: Mutex::new(QueueInner {
                remote_targets: BTreeSet::new(),
                messages: VecDeque::new(),
                cursor: 0,
                target_intersection: Vec::new(),
            }),
        }
    }

    pub fn add_target(&self, id: Uuid) {
        self.lock().remote_targets.insert(id);
    }

    pub fn routes_to(&self, id: &Uuid) -> bool {
        self.lock().remote_targets.contains(id)
    }

    pub fn remote_targets(&self) -> BTreeSet<Uuid> {
        self.lock().remote_targets.clone()
    }

    /// Inserts at the cursor position, i.e. immediately before the message
    /// that is next in line - the new message is scanned last, so insertion
    /// order is emission order.
    pub fn insert_message(&self, message: Arc<Message>) {
        let inner = &mut *self.lock();
        if inner.messages.is_empty() {
            inner.messages.push_back(message);
            inner.cursor = 0;
        } else {
            inner.messages.insert(inner.cursor, message);
            inner.cursor += 1;
        }
    }

    /// Packs as many messages as fit into the encoder's remaining budget and
    /// returns how many frames were written.
    ///
    /// Scans forward from the cursor, wrapping at most once, so no message is
    /// encoded twice into the same datagram and an early encoder overflow
    /// cannot starve the messages behind it. Messages whose target set no
    /// longer intersects this link's are dropped along the way.
    pub fn encode_few(&self, encoder: &mut DatagramEncoder) -> u16 {
        let inner = &mut *self.lock();

        let mut count: u16 = 0;
        let round = inner.messages.len();

        for _ in 0..round {
            if inner.messages.is_empty() {
                break;
            }
            let current = inner.cursor;
            let message = inner.messages[current].clone();

            message.intersect_targets_into(&inner.remote_targets, &mut inner.target_intersection);

            if inner.target_intersection.is_empty() {
                Self::erase(inner, &self.outbound, current, message);
                continue;
            }

            if !Self::try_encode(encoder, &message, &inner.target_intersection) {
                // try this one first in the next datagram
                inner.cursor = current;
                break;
            }
            count += 1;

            inner.cursor = current + 1;
            if inner.cursor >= inner.messages.len() {
                inner.cursor = 0;
            }

            // unreliable entries are sent only once to each target
            if !message.is_reliable() && message.remove_targets(&inner.remote_targets) {
                Self::erase(inner, &self.outbound, current, message);
            }
        }

        trace!("packed {} frames, {} messages remain queued", count, inner.messages.len());
        count
    }

    /// True iff there is nothing (left) to send on this link: no messages, or
    /// none of them has a target reachable through it.
    pub fn is_quiescent(&self) -> bool {
        let inner = self.lock();
        inner.messages.iter()
            .all(|m| !m.has_any_target_in(&inner.remote_targets))
    }

    /// Number of messages that would currently go out on this link.
    pub fn pending_message_count(&self) -> usize {
        let inner = self.lock();
        inner.messages.iter()
            .filter(|m| m.has_any_target_in(&inner.remote_targets))
            .count()
    }

    /// True iff a reliable message is still awaiting acknowledgement from a
    /// target on this link - i.e. the retransmit timer needs to stay armed.
    pub fn has_reliable_pending(&self) -> bool {
        let inner = self.lock();
        inner.messages.iter()
            .any(|m| m.is_reliable() && m.has_any_target_in(&inner.remote_targets))
    }

    /// Drops all queued messages, e.g. when the link is torn down.
    pub fn clear(&self) {
        let drained = {
            let inner = &mut *self.lock();
            inner.cursor = 0;
            std::mem::take(&mut inner.messages)
        };
        for message in drained {
            self.outbound.release(message);
        }
    }

    fn try_encode(encoder: &mut DatagramEncoder, message: &Message, targets: &[Uuid]) -> bool {
        let checkpoint = encoder.checkpoint();
        frame::encode_frame(encoder.buf(), &message.source(), targets, message.bytes());
        if encoder.fits() {
            true
        } else {
            encoder.rollback_to(checkpoint);
            false
        }
    }

    /// Removes the entry at `index` and hands the message back to the
    /// registry. The caller moves its own reference in so that `release`
    /// observes the true holder count.
    fn erase(inner: &mut QueueInner, outbound: &OutboundMessages, index: usize, message: Arc<Message>) {
        let removed = inner.messages.remove(index)
            .expect("erase index out of bounds");
        debug_assert!(Arc::ptr_eq(&removed, &message));
        drop(removed);

        // erasing at the cursor leaves it on the successor, wrapping to the
        // front at the end
        if index < inner.cursor {
            inner.cursor -= 1;
        }
        if inner.cursor >= inner.messages.len() {
            inner.cursor = 0;
        }

        outbound.release(message);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("transmit queue lock poisoned")
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        let inner = self.lock();
        if inner.messages.is_empty() {
            assert_eq!(inner.cursor, 0);
        } else {
            assert!(inner.cursor < inner.messages.len());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().messages.len()
    }
}
