// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod codec;
mod cursor_resolver;
mod errors;
mod file_source;
mod memory;
mod metrics;
mod shutter;
mod traits;

pub use self::codec::{write_bundle, JsonLinesBlockReader, JsonLinesBlockReaderFactory};
pub use self::cursor_resolver::CursorResolverHandler;
pub use self::errors::Error;
pub use self::file_source::{
    bundle_filename, FileSource, IncomingBlocksFile, PreprocessFunc, DEFAULT_BUNDLE_SIZE,
    DEFAULT_RETRY_DELAY,
};
pub use self::memory::MemoryObjectStore;
pub use self::traits::{
    BlockFetcher, BlockIndexer, BlockReader, BlockReaderFactory, DynReader, Gator, ObjectStore,
};
