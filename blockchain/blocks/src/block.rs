// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Cursor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a single block: an opaque id together with its number.
/// Two refs with the same number but different ids are siblings on
/// different forks. The empty ref (`""`, 0) is a distinguished value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: String,
    pub num: u64,
}

impl BlockRef {
    pub fn new(id: impl Into<String>, num: u64) -> Self {
        Self {
            id: id.into(),
            num,
        }
    }

    /// The distinguished empty ref.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.num == 0
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// Opaque payload attached to a block. The variants mirror the shapes the
/// snapshot format can carry; the library never looks inside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Raw(Vec<u8>),
    Json(String),
    Any { type_url: String, value: Vec<u8> },
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Raw(Vec::new())
    }
}

/// A decoded block record as produced by a block reader. `lib_num` is the
/// last irreversible block this block asserts. A block whose `previous_id`
/// equals its own `id` is bad data and rejected downstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub num: u64,
    pub previous_id: String,
    pub lib_num: u64,
    #[serde(default)]
    pub payload: Payload,
}

impl Block {
    pub fn new(
        id: impl Into<String>,
        num: u64,
        previous_id: impl Into<String>,
        lib_num: u64,
        payload: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            num,
            previous_id: previous_id.into(),
            lib_num,
            payload,
        }
    }

    /// The ref identifying this block.
    pub fn to_ref(&self) -> BlockRef {
        BlockRef::new(self.id.clone(), self.num)
    }

    /// Best-effort ref of the parent. The parent number is not carried on
    /// the wire, so `num - 1` stands in; comparisons are by id.
    pub fn previous_ref(&self) -> BlockRef {
        BlockRef::new(self.previous_id.clone(), self.num.saturating_sub(1))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// The opaque result of preprocessing a block, tagged with the cursor at
/// which the block entered the stream.
#[derive(Clone, Debug)]
pub struct ObjectWithCursor<O> {
    pub cursor: Cursor,
    pub obj: O,
}

/// A block paired with its preprocessing result, as delivered by a source.
#[derive(Clone, Debug)]
pub struct PreprocessedBlock<O> {
    pub block: Arc<Block>,
    pub obj: ObjectWithCursor<O>,
}
