// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use chainstream_blocks::Block;
use futures::io::AsyncRead;

/// Reader handed out by an [`ObjectStore`] for one stored object.
pub type DynReader = Box<dyn AsyncRead + Send + Unpin>;

/// Remote (or local) store holding block bundles as named objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn file_exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn open_object(&self, name: &str) -> anyhow::Result<DynReader>;
    /// Full diagnostic path of the object, for logging.
    fn object_path(&self, name: &str) -> String;
}

/// Sequential decoder over one bundle object.
#[async_trait]
pub trait BlockReader: Send {
    /// The next block, or `Ok(None)` at the end of the bundle.
    async fn read(&mut self) -> anyhow::Result<Option<Block>>;
}

/// Builds a [`BlockReader`] over a raw object reader.
pub trait BlockReaderFactory: Send + Sync {
    fn new_reader(&self, reader: DynReader) -> anyhow::Result<Box<dyn BlockReader>>;
}

/// Sparse index over bundle contents, letting the source skip blocks (and
/// whole bundles) that cannot match a query.
pub trait BlockIndexer: Send + Sync {
    /// The indexed block numbers within `[base, base + bundle_size)`,
    /// sorted ascending. `None` when the index has no knowledge of the
    /// range, which ends index-driven skipping.
    fn blocks_in_range(&self, base: u64, bundle_size: u64) -> anyhow::Result<Option<Vec<u64>>>;
}

/// Stateful block filter consulted before preprocessing.
pub trait Gator: Send {
    fn pass(&mut self, block: &Block) -> bool;
}

/// One-block lookup used to reconstruct emissions across a cursor resume
/// boundary.
pub trait BlockFetcher: Send + Sync {
    fn block_by_id(&self, id: &str) -> anyhow::Result<Option<Block>>;
}
