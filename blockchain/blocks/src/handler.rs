// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Block;
use std::sync::Arc;

/// Downstream consumer of a block stream. A source calls `process_block`
/// serially; the first error aborts the stream and is propagated to the
/// source's caller.
pub trait Handler<O>: Send + Sync {
    fn process_block(&self, block: Arc<Block>, obj: O) -> anyhow::Result<()>;
}

impl<O, H: Handler<O> + ?Sized> Handler<O> for Arc<H> {
    fn process_block(&self, block: Arc<Block>, obj: O) -> anyhow::Result<()> {
        (**self).process_block(block, obj)
    }
}

/// Adapter turning a closure into a [`Handler`].
pub struct HandlerFunc<F>(pub F);

impl<O, F> Handler<O> for HandlerFunc<F>
where
    F: Fn(Arc<Block>, O) -> anyhow::Result<()> + Send + Sync,
{
    fn process_block(&self, block: Arc<Block>, obj: O) -> anyhow::Result<()> {
        (self.0)(block, obj)
    }
}
