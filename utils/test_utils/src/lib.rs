// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic construction helpers for block stream tests.

use chainstream_blocks::{Block, BlockRef, Handler, Payload};
use parking_lot::Mutex;
use std::sync::Arc;

/// Builds a block with literal coordinates and an empty payload.
pub fn make_block(id: &str, num: u64, previous_id: &str, lib_num: u64) -> Arc<Block> {
    Arc::new(Block::new(id, num, previous_id, lib_num, Payload::default()))
}

/// Builds a block carrying a recognizable raw payload, for tests that
/// assert payloads travel end to end.
pub fn make_block_with_payload(
    id: &str,
    num: u64,
    previous_id: &str,
    lib_num: u64,
    payload: &[u8],
) -> Arc<Block> {
    Arc::new(Block::new(
        id,
        num,
        previous_id,
        lib_num,
        Payload::Raw(payload.to_vec()),
    ))
}

/// Shorthand for a [`BlockRef`] literal.
pub fn make_ref(id: &str, num: u64) -> BlockRef {
    BlockRef::new(id, num)
}

/// A handler recording every delivery, with an optional failure trigger
/// for error propagation tests.
pub struct CollectingHandler<O> {
    received: Mutex<Vec<(Arc<Block>, O)>>,
    fail_on_num: Option<u64>,
}

impl<O: Send + Sync> Default for CollectingHandler<O> {
    fn default() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            fail_on_num: None,
        }
    }
}

impl<O: Send + Sync> CollectingHandler<O> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler that errors when it sees the given block number.
    pub fn failing_at(num: u64) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            fail_on_num: Some(num),
        })
    }

    /// Everything received so far, in delivery order.
    pub fn received(&self) -> Vec<(Arc<Block>, O)>
    where
        O: Clone,
    {
        self.received.lock().clone()
    }

    /// Block numbers in delivery order.
    pub fn received_nums(&self) -> Vec<u64> {
        self.received.lock().iter().map(|(b, _)| b.num).collect()
    }

    /// Block ids in delivery order.
    pub fn received_ids(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|(b, _)| b.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

impl<O: Send + Sync> Handler<O> for CollectingHandler<O> {
    fn process_block(&self, block: Arc<Block>, obj: O) -> anyhow::Result<()> {
        if self.fail_on_num == Some(block.num) {
            anyhow::bail!("handler rejected block #{}", block.num);
        }
        self.received.lock().push((block, obj));
        Ok(())
    }
}
