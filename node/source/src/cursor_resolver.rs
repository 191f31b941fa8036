// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::traits::BlockFetcher;
use crate::Error;
use chainstream_blocks::{Block, Cursor, Handler, ObjectWithCursor, Step};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

enum ResolverState {
    Resolving(Cursor),
    PassThrough,
}

/// Wraps the terminal handler on the from-cursor path. Until the resumed
/// stream reconnects with the cursor it intercepts blocks: history the
/// client already has is dropped, and when the stream continues on a
/// different branch than the cursor's, the missing undos and redeliveries
/// are reconstructed from the one-block store. Once reconciled it is a
/// pure pass-through.
pub struct CursorResolverHandler<O, H> {
    handler: H,
    fetcher: Arc<dyn BlockFetcher>,
    state: Mutex<ResolverState>,
    _marker: std::marker::PhantomData<O>,
}

impl<O, H> CursorResolverHandler<O, H>
where
    O: Default + Send + Sync + 'static,
    H: Handler<ObjectWithCursor<O>>,
{
    pub fn new(handler: H, fetcher: Arc<dyn BlockFetcher>, cursor: Cursor) -> Self {
        let state = if cursor.is_empty() {
            ResolverState::PassThrough
        } else {
            ResolverState::Resolving(cursor)
        };
        Self {
            handler,
            fetcher,
            state: Mutex::new(state),
            _marker: std::marker::PhantomData,
        }
    }

    fn fetch(&self, id: &str, cursor: &Cursor) -> anyhow::Result<Block> {
        self.fetcher
            .block_by_id(id)?
            .ok_or_else(|| Error::UnresolvableCursor(cursor.clone()).into())
    }

    /// Walks both branches down to their junction and replays the journey:
    /// undos for the cursor side (most recent first), redeliveries for the
    /// new side (oldest first).
    fn reconcile(&self, cursor: &Cursor, head: &Block) -> anyhow::Result<()> {
        let mut undo_side = self.fetch(&cursor.block.id, cursor)?;
        let mut redo_side = self.fetch(&head.previous_id, cursor)?;
        let mut undos = Vec::new();
        let mut redos = Vec::new();
        loop {
            if undo_side.id == redo_side.id {
                break; // junction
            }
            // neither branch can reach below the cursor's own LIB
            if undo_side.num < cursor.lib.num || redo_side.num < cursor.lib.num {
                return Err(Error::UnresolvableCursor(cursor.clone()).into());
            }
            if undo_side.num >= redo_side.num {
                let parent = self.fetch(&undo_side.previous_id, cursor)?;
                undos.push(std::mem::replace(&mut undo_side, parent));
            } else {
                let parent = self.fetch(&redo_side.previous_id, cursor)?;
                redos.push(std::mem::replace(&mut redo_side, parent));
            }
        }
        redos.reverse();
        // a mid-undo cursor rolled its own block back already; if that
        // block turns out to be canonical again it must flow anew
        if cursor.step == Step::Undo && undo_side.id == cursor.block.id {
            redos.insert(0, undo_side);
        }

        let head_ref = head.to_ref();
        for (index, block) in undos.into_iter().enumerate() {
            if index == 0 && cursor.step == Step::Undo {
                continue; // the cursor block was already undone client-side
            }
            let block = Arc::new(block);
            let emitted = Cursor::new(
                Step::Undo,
                block.to_ref(),
                head_ref.clone(),
                cursor.lib.clone(),
            );
            self.handler.process_block(
                block,
                ObjectWithCursor {
                    cursor: emitted,
                    obj: O::default(),
                },
            )?;
        }
        for block in redos {
            let block = Arc::new(block);
            let emitted = Cursor::new(
                Step::New,
                block.to_ref(),
                head_ref.clone(),
                cursor.lib.clone(),
            );
            self.handler.process_block(
                block,
                ObjectWithCursor {
                    cursor: emitted,
                    obj: O::default(),
                },
            )?;
        }
        Ok(())
    }
}

impl<O, H> Handler<ObjectWithCursor<O>> for CursorResolverHandler<O, H>
where
    O: Default + Send + Sync + 'static,
    H: Handler<ObjectWithCursor<O>>,
{
    fn process_block(&self, block: Arc<Block>, obj: ObjectWithCursor<O>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let cursor = match &*state {
            ResolverState::PassThrough => return self.handler.process_block(block, obj),
            ResolverState::Resolving(cursor) => cursor.clone(),
        };

        if block.num < cursor.block.num {
            return Ok(()); // history the client already has
        }
        if block.id == cursor.block.id {
            debug!("resumed stream reconnected with cursor block {block}");
            *state = ResolverState::PassThrough;
            return Ok(());
        }
        if block.previous_id == cursor.block.id && cursor.step != Step::Undo {
            // clean continuation of the cursor's own chain
            *state = ResolverState::PassThrough;
            return self.handler.process_block(block, obj);
        }

        self.reconcile(&cursor, &block)?;
        *state = ResolverState::PassThrough;
        self.handler.process_block(block, obj)
    }
}
