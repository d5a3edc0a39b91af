use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::trace;
use uuid::Uuid;

use crate::ack_set::AckSet;
use crate::frame::AckBlock;
use crate::message::MessageKind;
use crate::sequence_number::SequenceNumber;

/// What to do with a received frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Acceptance {
    /// New to this node: deliver (if addressed to us) and forward.
    Accepted,
    /// Already seen. Not delivered again, but re-acknowledged - the previous
    /// acknowledgement may have been lost.
    Duplicate,
    /// Cannot be accounted for yet (out of order, or the ack window would
    /// lose unacknowledged history). Dropped without acknowledgement; the
    /// sender will retransmit if it cares.
    Rejected,
}

/// Receive-side bookkeeping, one entry per originating sender.
///
/// The ack window doubles as duplicate suppression. Reliable frames are
/// additionally gated on a watermark so they are only ever delivered in
/// sequence order: a reliable frame ahead of the watermark is left to
/// retransmission instead of being delivered early. Unreliable frames carry
/// no ordering promise and move the watermark forward past themselves.
pub struct InboundDispatcher {
    states: Mutex<FxHashMap<Uuid, ReceiveState>>,
}

struct ReceiveState {
    acks: AckSet,
    next_in_order: SequenceNumber,
    ack_dirty: bool,
}

impl ReceiveState {
    fn new() -> ReceiveState {
        ReceiveState {
            acks: AckSet::new(),
            next_in_order: SequenceNumber::ZERO,
            ack_dirty: false,
        }
    }
}

impl InboundDispatcher {
    pub fn new() -> InboundDispatcher {
        InboundDispatcher {
            states: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn accept(&self, source: Uuid, sn: SequenceNumber, kind: MessageKind) -> Acceptance {
        let mut states = self.states.lock().expect("dispatcher lock poisoned");
        let state = states.entry(source).or_insert_with(ReceiveState::new);

        let reliable = kind == MessageKind::Reliable;

        if state.acks.contains(sn) || (reliable && sn < state.next_in_order) {
            trace!("duplicate frame {} from {}", sn, source);
            state.ack_dirty = true;
            return Acceptance::Duplicate;
        }

        if reliable && sn != state.next_in_order {
            trace!("reliable frame {} from {} ahead of watermark {} - awaiting retransmit",
                sn, source, state.next_in_order);
            return Acceptance::Rejected;
        }

        if !state.acks.try_add(sn) {
            trace!("frame {} from {} does not fit the ack window - dropping", sn, source);
            return Acceptance::Rejected;
        }

        if sn >= state.next_in_order {
            state.next_in_order = sn.next();
        }
        state.ack_dirty = true;
        Acceptance::Accepted
    }

    /// Drains the senders whose ack state changed since the last call,
    /// snapshotting each into a wire-ready block with us as the acker.
    pub fn take_dirty_acks(&self, self_id: Uuid) -> Vec<AckBlock> {
        let mut states = self.states.lock().expect("dispatcher lock poisoned");

        let mut blocks = Vec::new();
        for (source, state) in states.iter_mut() {
            if state.ack_dirty && !state.acks.is_empty() {
                state.ack_dirty = false;
                blocks.push(AckBlock {
                    acker: self_id,
                    source: *source,
                    acks: state.acks,
                });
            }
        }
        blocks
    }
}

impl Default for InboundDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn uuid(tail: u8) -> Uuid {
        Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, tail])
    }

    fn sn(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    #[test]
    fn test_reliable_in_order_stream() {
        let dispatcher = InboundDispatcher::new();
        for i in 0..100 {
            assert_eq!(dispatcher.accept(uuid(1), sn(i), MessageKind::Reliable), Acceptance::Accepted);
        }
    }

    #[test]
    fn test_reliable_ahead_of_watermark_is_rejected_until_gap_fills() {
        let dispatcher = InboundDispatcher::new();

        assert_eq!(dispatcher.accept(uuid(1), sn(0), MessageKind::Reliable), Acceptance::Accepted);
        // sn 1 lost in transit; 2 must wait for it
        assert_eq!(dispatcher.accept(uuid(1), sn(2), MessageKind::Reliable), Acceptance::Rejected);
        assert_eq!(dispatcher.accept(uuid(1), sn(1), MessageKind::Reliable), Acceptance::Accepted);
        assert_eq!(dispatcher.accept(uuid(1), sn(2), MessageKind::Reliable), Acceptance::Accepted);
    }

    #[test]
    fn test_first_reliable_frame_must_be_sequence_zero() {
        let dispatcher = InboundDispatcher::new();
        assert_eq!(dispatcher.accept(uuid(1), sn(3), MessageKind::Reliable), Acceptance::Rejected);
        assert_eq!(dispatcher.accept(uuid(1), sn(0), MessageKind::Reliable), Acceptance::Accepted);
    }

    #[rstest]
    #[case::reliable(MessageKind::Reliable)]
    #[case::unreliable(MessageKind::Unreliable)]
    fn test_duplicate_is_reacknowledged_not_redelivered(#[case] kind: MessageKind) {
        let dispatcher = InboundDispatcher::new();

        assert_eq!(dispatcher.accept(uuid(1), sn(0), kind), Acceptance::Accepted);
        assert_eq!(dispatcher.take_dirty_acks(uuid(9)).len(), 1);

        assert_eq!(dispatcher.accept(uuid(1), sn(0), kind), Acceptance::Duplicate);
        // the duplicate re-arms the ack so a lost acknowledgement gets resent
        let blocks = dispatcher.take_dirty_acks(uuid(9));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].acker, uuid(9));
        assert_eq!(blocks[0].source, uuid(1));
        assert!(blocks[0].acks.contains(sn(0)));
    }

    #[test]
    fn test_unreliable_advances_watermark_past_gaps() {
        let dispatcher = InboundDispatcher::new();

        assert_eq!(dispatcher.accept(uuid(1), sn(0), MessageKind::Unreliable), Acceptance::Accepted);
        // sn 1 was an unreliable message that got lost; 2 is deliverable anyway
        assert_eq!(dispatcher.accept(uuid(1), sn(2), MessageKind::Unreliable), Acceptance::Accepted);
        // and the reliable stream continues behind it
        assert_eq!(dispatcher.accept(uuid(1), sn(3), MessageKind::Reliable), Acceptance::Accepted);
    }

    #[test]
    fn test_mixed_in_order_stream() {
        let dispatcher = InboundDispatcher::new();
        for i in 0..64 {
            let kind = if i % 2 == 0 { MessageKind::Reliable } else { MessageKind::Unreliable };
            assert_eq!(dispatcher.accept(uuid(1), sn(i), kind), Acceptance::Accepted, "sn {}", i);
        }
    }

    #[test]
    fn test_sources_are_tracked_independently() {
        let dispatcher = InboundDispatcher::new();

        assert_eq!(dispatcher.accept(uuid(1), sn(0), MessageKind::Reliable), Acceptance::Accepted);
        assert_eq!(dispatcher.accept(uuid(2), sn(0), MessageKind::Reliable), Acceptance::Accepted);

        let mut blocks = dispatcher.take_dirty_acks(uuid(9));
        blocks.sort_by_key(|b| b.source);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].source, uuid(1));
        assert_eq!(blocks[1].source, uuid(2));

        // nothing dirty after draining
        assert!(dispatcher.take_dirty_acks(uuid(9)).is_empty());
    }

    #[test]
    fn test_unreliable_beyond_window_is_dropped() {
        let dispatcher = InboundDispatcher::new();
        assert_eq!(dispatcher.accept(uuid(1), sn(0), MessageKind::Unreliable), Acceptance::Accepted);
        assert_eq!(dispatcher.accept(uuid(1), sn(100), MessageKind::Unreliable), Acceptance::Rejected);
    }
}
