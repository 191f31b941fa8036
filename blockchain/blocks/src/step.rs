// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use enumflags2::{bitflags, BitFlags};
use std::fmt;

/// Role of a block within the stream. Steps form an orthogonal bitmask so
/// consumers can subscribe to any subset through [`Steps`].
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// First delivery of a block on the current best chain.
    New = 0b00001,
    /// A previously delivered block is rolled back by a chain switch.
    Undo = 0b00010,
    /// A block delivered as `New` earlier is now final.
    Irreversible = 0b00100,
    /// A block delivered for the first time and already final.
    NewIrreversible = 0b01000,
    /// A block that fell below the LIB on a losing branch.
    Stalled = 0b10000,
}

/// A set of [`Step`] values used for filtering emissions.
pub type Steps = BitFlags<Step>;

/// The union of every step kind.
pub fn steps_all() -> Steps {
    BitFlags::all()
}

impl Default for Step {
    fn default() -> Self {
        Step::New
    }
}

impl Step {
    /// Numeric wire representation used inside opaque cursors.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Step::bits`]; `None` when the byte is not a single step.
    pub fn from_bits(bits: u8) -> Option<Self> {
        BitFlags::<Step>::from_bits(bits)
            .ok()
            .and_then(|flags| flags.exactly_one())
    }

    /// True for the two step kinds that mark a block as final.
    pub fn is_irreversible(self) -> bool {
        matches!(self, Step::Irreversible | Step::NewIrreversible)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::New => "new",
            Step::Undo => "undo",
            Step::Irreversible => "irreversible",
            Step::NewIrreversible => "new_irreversible",
            Step::Stalled => "stalled",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip() {
        for step in [
            Step::New,
            Step::Undo,
            Step::Irreversible,
            Step::NewIrreversible,
            Step::Stalled,
        ] {
            assert_eq!(Step::from_bits(step.bits()), Some(step));
        }
        assert_eq!(Step::from_bits(0), None);
        assert_eq!(Step::from_bits(0b00011), None);
        assert_eq!(Step::from_bits(0b100000), None);
    }

    #[test]
    fn all_covers_every_step() {
        let all = steps_all();
        assert!(all.contains(Step::New));
        assert!(all.contains(Step::Undo));
        assert!(all.contains(Step::Irreversible));
        assert!(all.contains(Step::NewIrreversible));
        assert!(all.contains(Step::Stalled));
    }
}
