// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chainstream_blocks::Cursor;
use thiserror::Error;

/// File source error
#[derive(Debug, Error)]
pub enum Error {
    /// Object store access failed (other than a missing bundle, which is
    /// retried forever).
    #[error("object store: {0}")]
    Store(#[source] anyhow::Error),
    /// Opening or decoding a bundle failed.
    #[error("block reader: {0}")]
    Reader(#[source] anyhow::Error),
    /// The block index itself failed; distinct from an index that simply
    /// has no knowledge of a range.
    #[error("block index: {0}")]
    Index(#[source] anyhow::Error),
    /// The index walked past the configured stop block.
    #[error("block index base {base} is beyond stop block {stop}")]
    IndexBeyondStop { base: u64, stop: u64 },
    /// Preprocessing a block failed; shuts the source down.
    #[error("preprocessor: {0}")]
    Preprocess(#[source] anyhow::Error),
    /// The sink handler rejected a block; shuts the source down.
    #[error("handler: {0}")]
    Handler(#[source] anyhow::Error),
    /// The journey from this cursor to the live stream could not be
    /// reconstructed from the one-block store.
    #[error("cursor {0} cannot be resolved against the one-block store")]
    UnresolvableCursor(Cursor),
}
