use crate::sequence_number::SequenceNumber;

/// A sliding window over the 32 most recently acknowledged sequence numbers
/// of one sender.
///
/// The window is anchored at `highest`: bit `i` of `predecessors` is set iff
/// `highest - (i+1)` has been acknowledged. Only the low 31 bits of the mask
/// are meaningful. `lowest` remembers where the window started so that slots
/// which never existed (before the first acknowledged number) can slide out
/// freely.
///
/// Everything below the window is treated as already acknowledged: the insert
/// path refuses to shift an unacknowledged slot out of the low end, so a
/// value can only drop below the window after it was accounted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckSet {
    highest_sequence_number: SequenceNumber,
    lowest_sequence_number: SequenceNumber,
    predecessors: u32,
    is_empty: bool,
}

const PREDECESSOR_MASK: u32 = 0x7fff_ffff;

impl AckSet {
    pub fn new() -> AckSet {
        AckSet {
            highest_sequence_number: SequenceNumber::ZERO,
            lowest_sequence_number: SequenceNumber::ZERO,
            predecessors: 0,
            is_empty: true,
        }
    }

    /// Reconstructs a window from its wire representation. The low anchor is
    /// lost in transit; it is not needed for membership queries.
    pub fn from_wire(highest: SequenceNumber, predecessors: u32) -> AckSet {
        AckSet {
            highest_sequence_number: highest,
            lowest_sequence_number: highest,
            predecessors: predecessors & PREDECESSOR_MASK,
            is_empty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn highest(&self) -> Option<SequenceNumber> {
        if self.is_empty {
            None
        } else {
            Some(self.highest_sequence_number)
        }
    }

    pub fn predecessors(&self) -> u32 {
        self.predecessors
    }

    /// Inserts `sn` into the window.
    ///
    /// Returns `false` only when accepting `sn` would shift a slot that is
    /// neither acknowledged nor vacuous out of the low end - i.e. the window
    /// would forget that something is still missing. In every other case the
    /// insert succeeds: re-adding a present number is a no-op, and numbers
    /// below the window count as already acknowledged.
    pub fn try_add(&mut self, new_sn: SequenceNumber) -> bool {
        if self.is_empty {
            self.highest_sequence_number = new_sn;
            self.lowest_sequence_number = new_sn;
            self.predecessors = 0;
            self.is_empty = false;
            return true;
        }

        let hsn = self.highest_sequence_number;

        match hsn.checked_minus(new_sn) {
            // re-adding the highest is a no-op
            Some(0) => true,
            // below the window: treated as already acknowledged
            Some(delta) if delta > 31 => true,
            Some(delta) => {
                self.predecessors |= 1 << (delta - 1);
                true
            }
            // new_sn is ahead of the window
            None => {
                let shift = new_sn.to_raw() - hsn.to_raw();
                if shift > 31 {
                    return false;
                }

                // every slot that would be shifted out must be acknowledged
                // or predate the window's start
                let hsn_raw = hsn.to_raw() as u64;
                let lowest_raw = self.lowest_sequence_number.to_raw() as u64;
                for i in 0..shift as u64 {
                    let vacuous = hsn_raw < lowest_raw + 31 - i;
                    let acked = self.predecessors & (1 << (30 - i)) != 0;
                    if !(vacuous || acked) {
                        return false;
                    }
                }

                self.predecessors = (self.predecessors << shift) & PREDECESSOR_MASK;
                self.predecessors |= 1 << (shift - 1);
                self.highest_sequence_number = new_sn;
                true
            }
        }
    }

    /// True iff the window accounts for `sn`: it is the highest, a set
    /// predecessor slot, or below the window (treated as acknowledged).
    pub fn contains(&self, sn: SequenceNumber) -> bool {
        if self.is_empty {
            return false;
        }
        match self.highest_sequence_number.checked_minus(sn) {
            // ahead of the window
            None => false,
            Some(0) => true,
            // below the window: treated as acknowledged
            Some(delta) if delta > 31 => true,
            Some(delta) => self.predecessors & (1 << (delta - 1)) != 0,
        }
    }

    /// Sequence numbers currently in the window, highest first.
    pub fn iter(&self) -> AckSetIter {
        AckSetIter {
            highest: self.highest_sequence_number,
            predecessors: self.predecessors,
            pos: if self.is_empty { 32 } else { 0 },
        }
    }
}

impl Default for AckSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AckSetIter {
    highest: SequenceNumber,
    predecessors: u32,
    pos: u32,
}

impl Iterator for AckSetIter {
    type Item = SequenceNumber;

    fn next(&mut self) -> Option<SequenceNumber> {
        while self.pos < 32 {
            let pos = self.pos;
            self.pos += 1;
            if pos == 0 {
                return Some(self.highest);
            }
            if self.predecessors & (1 << (pos - 1)) != 0 {
                if let Some(raw) = self.highest.to_raw().checked_sub(pos) {
                    return Some(SequenceNumber::from_raw(raw));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rstest::rstest;

    fn sn(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn collect(acks: &AckSet) -> Vec<u32> {
        acks.iter().map(|s| s.to_raw()).collect()
    }

    #[test]
    fn test_empty() {
        let acks = AckSet::new();
        assert!(acks.is_empty());
        assert_eq!(acks.highest(), None);
        assert_eq!(collect(&acks), Vec::<u32>::new());
        assert!(!acks.contains(sn(0)));
    }

    #[rstest]
    #[case::first(vec![5], vec![5])]
    #[case::idempotent(vec![5, 5, 5], vec![5])]
    #[case::ascending(vec![5, 6, 7], vec![7, 6, 5])]
    #[case::descending(vec![7, 6, 5], vec![7, 6, 5])]
    #[case::gap(vec![5, 8], vec![8, 5])]
    #[case::gap_filled_later(vec![5, 8, 7, 6], vec![8, 7, 6, 5])]
    #[case::too_old_ignored(vec![100, 50], vec![100])]
    #[case::window_edge_kept(vec![100, 69], vec![100, 69])]
    #[case::full_jump_from_start(vec![0, 31], vec![31, 0])]
    fn test_try_add_accepts(#[case] inserts: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut acks = AckSet::new();
        for i in inserts {
            assert!(acks.try_add(sn(i)), "inserting {} should succeed", i);
        }
        assert_eq!(collect(&acks), expected);
    }

    #[rstest]
    #[case::beyond_window(vec![0], 32)]
    #[case::far_beyond_window(vec![0], 1000)]
    #[case::would_lose_unacked_hole(vec![0, 31], 33)]
    fn test_try_add_rejects(#[case] inserts: Vec<u32>, #[case] rejected: u32) {
        let mut acks = AckSet::new();
        for i in inserts {
            assert!(acks.try_add(sn(i)));
        }
        let before = acks;
        assert!(!acks.try_add(sn(rejected)));
        assert_eq!(acks, before, "a rejected insert must not change the window");
    }

    #[test]
    fn test_contiguous_window_slides_freely() {
        let mut acks = AckSet::new();
        for i in 0..1000 {
            assert!(acks.try_add(sn(i)), "contiguous insert {} rejected", i);
        }
        assert_eq!(acks.highest(), Some(sn(999)));
        assert_eq!(collect(&acks), (968..=999).rev().collect::<Vec<_>>());
        // everything below the window counts as acknowledged
        assert!(acks.contains(sn(0)));
        assert!(acks.contains(sn(967)));
    }

    #[test]
    fn test_unacked_hole_blocks_slide() {
        let mut acks = AckSet::new();
        assert!(acks.try_add(sn(0)));
        // 1 is missing; 2..=31 fill the rest of the window
        for i in 2..=31 {
            assert!(acks.try_add(sn(i)));
        }
        // sliding past 1 would lose the hole
        assert!(!acks.try_add(sn(33)));
        // the hole itself is still insertable, after which the slide works
        assert!(acks.try_add(sn(1)));
        assert!(acks.try_add(sn(33)));
    }

    #[test]
    fn test_contains_matches_iterator() {
        let mut acks = AckSet::new();
        for i in [3u32, 4, 7, 9, 10, 12] {
            assert!(acks.try_add(sn(i)));
        }
        for i in 0..40 {
            let in_iter = collect(&acks).contains(&i);
            let below_window = i + 31 < acks.highest().unwrap().to_raw();
            assert_eq!(acks.contains(sn(i)), in_iter || below_window, "sn {}", i);
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut acks = AckSet::new();
        for i in [20u32, 22, 25, 19] {
            assert!(acks.try_add(sn(i)));
        }
        let wire = AckSet::from_wire(acks.highest().unwrap(), acks.predecessors());
        assert_eq!(collect(&wire), collect(&acks));
        for i in 0..30 {
            assert_eq!(wire.contains(sn(i)), acks.contains(sn(i)), "sn {}", i);
        }
    }

    /// For inserts within any fixed 32-wide window, the iterator must yield
    /// exactly the distinct inserted numbers in descending order.
    #[test]
    fn test_random_inserts_within_window() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..200 {
            let base: u32 = rng.gen_range(0..100_000);
            let mut acks = AckSet::new();
            let mut model = std::collections::BTreeSet::new();

            for _ in 0..rng.gen_range(1..64) {
                let value = base + rng.gen_range(0..32);
                assert!(acks.try_add(sn(value)), "round {}: {} rejected", round, value);
                model.insert(value);

                let expected = model.iter().rev().cloned().collect::<Vec<_>>();
                assert_eq!(collect(&acks), expected, "round {}", round);
            }
        }
    }

    #[test]
    fn test_try_add_idempotent_after_random_history() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut acks = AckSet::new();
        for _ in 0..100 {
            let value = rng.gen_range(0..200);
            let accepted = acks.try_add(sn(value));
            let snapshot = acks;
            assert_eq!(acks.try_add(sn(value)), accepted);
            assert_eq!(acks, snapshot);
        }
    }
}
