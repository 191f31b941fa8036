// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{BlockRef, Error, Step};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A resume token: the last delivered block together with the head and LIB
/// observed at delivery time. Invariant: `lib.num <= block.num <=
/// head_block.num`.
///
/// The wire form is an opaque colon-separated string
/// (`c1:<step>:<block_num>:<block_id>:<head_num>:<head_id>:<lib_num>:<lib_id>`);
/// ids are expected to be colon-free, as chain ids in practice are. The
/// empty cursor round-trips as the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub step: Step,
    pub block: BlockRef,
    pub head_block: BlockRef,
    pub lib: BlockRef,
}

impl Cursor {
    pub fn new(step: Step, block: BlockRef, head_block: BlockRef, lib: BlockRef) -> Self {
        Self {
            step,
            block,
            head_block,
            lib,
        }
    }

    /// The distinguished empty cursor.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty() && self.head_block.is_empty() && self.lib.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(
            f,
            "c1:{}:{}:{}:{}:{}:{}:{}",
            self.step.bits(),
            self.block.num,
            self.block.id,
            self.head_block.num,
            self.head_block.id,
            self.lib.num,
            self.lib.id,
        )
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Cursor::empty());
        }
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 || parts[0] != "c1" {
            return Err(Error::InvalidCursor(s.to_string()));
        }
        let num = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| Error::InvalidCursor(s.to_string()))
        };
        let step_bits = parts[1]
            .parse::<u8>()
            .map_err(|_| Error::InvalidCursor(s.to_string()))?;
        let step = Step::from_bits(step_bits).ok_or(Error::InvalidStep(step_bits))?;
        let cursor = Cursor {
            step,
            block: BlockRef::new(parts[3], num(parts[2])?),
            head_block: BlockRef::new(parts[5], num(parts[4])?),
            lib: BlockRef::new(parts[7], num(parts[6])?),
        };
        if cursor.lib.num > cursor.block.num || cursor.block.num > cursor.head_block.num {
            return Err(Error::InvalidCursor(s.to_string()));
        }
        Ok(cursor)
    }
}

impl Serialize for Cursor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
