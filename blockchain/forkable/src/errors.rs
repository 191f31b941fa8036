// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chainstream_blocks::BlockRef;
use thiserror::Error;

/// Fork tracking error
#[derive(Debug, Error)]
pub enum Error {
    /// A block naming itself as its own parent is bad data.
    #[error("block {0} refers to itself as parent")]
    SelfReference(BlockRef),
    /// Too many blocks in a row could not be linked to the tracked DAG;
    /// the upstream is most likely following a different chain.
    #[error("{count} consecutive unlinkable blocks, last {last}")]
    UnlinkableFlood { count: usize, last: BlockRef },
    /// Error returned by the downstream handler; aborts the stream.
    #[error("handler: {0}")]
    Handler(#[source] anyhow::Error),
    /// Snapshot encoding or decoding failed.
    #[error("snapshot: {0}")]
    Snapshot(#[source] anyhow::Error),
}
