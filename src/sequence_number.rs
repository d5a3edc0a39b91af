use std::fmt::{Display, Formatter};

/// Per-sender message counter. Values are compared as plain numbers - the
/// protocol does not wrap, but all window arithmetic assumes that live values
/// stay within a 32-wide window of each other.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(
            self.0.checked_add(1)
                .expect("sequence number space exhausted")
        )
    }

    /// Distance down to a smaller sequence number, `None` if `other` is
    /// bigger.
    pub fn checked_minus(&self, other: SequenceNumber) -> Option<u32> {
        self.0.checked_sub(other.0)
    }
}
