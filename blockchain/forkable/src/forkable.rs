// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::forkdb::{ForkDb, ForkableBlock};
use crate::{metrics, Error};
use chainstream_blocks::{steps_all, Block, BlockRef, Cursor, Handler, Step, Steps};
use log::{debug, warn};
use parking_lot::RwLock;
use std::sync::Arc;

/// Above this many consecutive blocks that cannot link to the DAG, the
/// upstream is assumed to follow a different chain and the stream aborts.
const MAX_CONSECUTIVE_UNLINKABLE_BLOCKS: usize = 20;

/// The step-annotated event handed to the downstream handler alongside the
/// block. Multi-block emissions (undo, irreversible, stalled segments)
/// carry their position within the batch so receivers may regroup them.
#[derive(Debug)]
pub struct ForkableObject<O> {
    pub step: Step,
    pub block: Arc<Block>,
    pub head_block: BlockRef,
    pub last_lib_sent: BlockRef,
    pub obj: Arc<O>,
    pub step_index: usize,
    pub step_count: usize,
    pub step_blocks: Arc<Vec<ForkableBlock<O>>>,
}

impl<O> Clone for ForkableObject<O> {
    fn clone(&self) -> Self {
        Self {
            step: self.step,
            block: self.block.clone(),
            head_block: self.head_block.clone(),
            last_lib_sent: self.last_lib_sent.clone(),
            obj: self.obj.clone(),
            step_index: self.step_index,
            step_count: self.step_count,
            step_blocks: self.step_blocks.clone(),
        }
    }
}

impl<O> ForkableObject<O> {
    /// The resume token for this emission. The LIB component is clamped to
    /// the block itself so the cursor invariant holds even for stalled
    /// blocks sitting below the LIB.
    pub fn cursor(&self) -> Cursor {
        let lib = if self.last_lib_sent.num > self.block.num {
            self.block.to_ref()
        } else {
            self.last_lib_sent.clone()
        };
        Cursor::new(self.step, self.block.to_ref(), self.head_block.clone(), lib)
    }
}

pub(crate) struct State<O> {
    pub(crate) forkdb: ForkDb<O>,
    pub(crate) last_block_sent: Option<BlockRef>,
    pub(crate) last_lib_seen: BlockRef,
    pub(crate) last_longest_chain: Vec<ForkableBlock<O>>,
    pub(crate) consecutive_unlinkable_blocks: usize,
    pub(crate) ensure_block_flowed: bool,
}

/// Fork-aware step emitter. Every block inserted through
/// [`Handler::process_block`] updates the in-memory [`ForkDb`], recomputes
/// the longest chain and derives the step events owed to the downstream
/// handler: `New` on canonical-chain growth, `Undo`/`New` pairs on chain
/// switches, `Irreversible` and `Stalled` when the LIB advances.
///
/// The downstream handler is invoked while the internal write lock is
/// held: handlers must not call back into the same `Forkable`, or they
/// will deadlock.
pub struct Forkable<O, H> {
    handler: H,
    filter_steps: Steps,
    ensure_block_flows: BlockRef,
    ensure_all_blocks_trigger_longest_chain: bool,
    hold_blocks_until_lib: bool,
    include_initial_lib: bool,
    kept_final_blocks: u64,
    pub(crate) state: RwLock<State<O>>,
}

impl<O, H> Forkable<O, H>
where
    O: Send + Sync + 'static,
    H: Handler<ForkableObject<O>>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            filter_steps: steps_all(),
            ensure_block_flows: BlockRef::empty(),
            ensure_all_blocks_trigger_longest_chain: false,
            hold_blocks_until_lib: false,
            include_initial_lib: false,
            kept_final_blocks: 100,
            state: RwLock::new(State {
                forkdb: ForkDb::new(),
                last_block_sent: None,
                last_lib_seen: BlockRef::empty(),
                last_longest_chain: Vec::new(),
                consecutive_unlinkable_blocks: 0,
                ensure_block_flowed: true,
            }),
        }
    }

    /// Restricts which step kinds reach the handler. Suppressed steps are
    /// still computed and tracked.
    pub fn with_filters(mut self, steps: Steps) -> Self {
        self.filter_steps = steps;
        self
    }

    /// Requires the given block to flow as `New` before LIB advancement
    /// yields anything downstream.
    pub fn ensure_block_flows(mut self, block_ref: BlockRef) -> Self {
        self.state.get_mut().ensure_block_flowed = block_ref.is_empty();
        self.ensure_block_flows = block_ref;
        self
    }

    /// Re-evaluates the longest chain on every block, even those at or
    /// below the last sent head.
    pub fn ensure_all_blocks_trigger_longest_chain(mut self) -> Self {
        self.ensure_all_blocks_trigger_longest_chain = true;
        self
    }

    /// Holds all emission until the LIB is known.
    pub fn hold_blocks_until_lib(mut self) -> Self {
        self.hold_blocks_until_lib = true;
        self
    }

    /// Emits the very first block whose id equals the initial LIB
    /// (bootstrap of a restored fork DB).
    pub fn include_initial_lib(mut self) -> Self {
        self.include_initial_lib = true;
        self
    }

    /// How many blocks below the LIB stay in memory after a purge.
    pub fn with_kept_final_blocks(mut self, kept: u64) -> Self {
        self.kept_final_blocks = kept;
        self
    }

    /// Starts from a previously captured fork DB instead of an empty one.
    pub fn with_fork_db(mut self, forkdb: ForkDb<O>) -> Self {
        self.state.get_mut().forkdb = forkdb;
        self
    }

    /// Current LIB tracked by the fork DB.
    pub fn lib(&self) -> BlockRef {
        self.state.read().forkdb.lib_ref().clone()
    }

    /// Ref of the last block delivered as `New`, if any.
    pub fn last_block_sent(&self) -> Option<BlockRef> {
        self.state.read().last_block_sent.clone()
    }

    /// Runs the full state machine for one incoming block.
    pub fn process(&self, block: Arc<Block>, obj: Arc<O>) -> Result<(), Error> {
        if block.id == block.previous_id {
            return Err(Error::SelfReference(block.to_ref()));
        }
        let mut state = self.state.write();
        self.process_inner(&mut state, block, obj)
    }

    fn process_inner(
        &self,
        s: &mut State<O>,
        block: Arc<Block>,
        obj: Arc<O>,
    ) -> Result<(), Error> {
        // Replays of already-final history are tolerated silently.
        if block.num < s.forkdb.lib_num() && s.last_block_sent.is_some() {
            debug!(
                "ignoring block {} already below the LIB {}",
                block,
                s.forkdb.lib_ref()
            );
            return Ok(());
        }

        let triggers_new_longest_chain = self.triggers_new_longest_chain(s, &block);

        if self.include_initial_lib
            && s.last_block_sent.is_none()
            && block.id == s.forkdb.lib_id()
        {
            return self.process_initial_inclusive_irreversible_block(s, block, obj, true);
        }

        // Chain-switch segments must be derived against the DB as it was
        // before this block joins it.
        let (undos, redos) = if triggers_new_longest_chain
            && s.last_block_sent.is_some()
            && self.filter_steps.contains(Step::Undo)
        {
            self.sent_chain_switch_segments(s, &block.previous_id)
        } else {
            (Vec::new(), Vec::new())
        };

        if s.forkdb.add_link(block.clone(), obj.clone()) {
            return Ok(()); // seen before
        }

        let mut first_irreversible_block: Option<ForkableBlock<O>> = None;
        if !s.forkdb.has_lib() {
            s.forkdb
                .set_lib(&block.to_ref(), &block.previous_id, block.lib_num);
            if s.forkdb.has_lib() {
                if block.num == s.forkdb.lib_num() {
                    return self.process_initial_inclusive_irreversible_block(
                        s,
                        block,
                        obj,
                        self.include_initial_lib,
                    );
                }
                first_irreversible_block =
                    s.forkdb.block_for_id(&s.forkdb.lib_id().to_string()).cloned();
            } else if self.hold_blocks_until_lib {
                return Ok(());
            }
        }

        let longest_chain = self.compute_new_longest_chain(s, &block);

        if longest_chain.is_empty() && s.forkdb.has_lib() {
            s.consecutive_unlinkable_blocks += 1;
            metrics::UNLINKABLE_BLOCKS_TOTAL.inc();
            if s.consecutive_unlinkable_blocks > MAX_CONSECUTIVE_UNLINKABLE_BLOCKS {
                warn!(
                    "{} consecutive unlinkable blocks, last {}: upstream likely on another chain",
                    s.consecutive_unlinkable_blocks, block
                );
                return Err(Error::UnlinkableFlood {
                    count: s.consecutive_unlinkable_blocks,
                    last: block.to_ref(),
                });
            }
            debug!(
                "block {} not linkable to the current chain yet ({} in a row)",
                block, s.consecutive_unlinkable_blocks
            );
            return Ok(());
        }
        s.consecutive_unlinkable_blocks = 0;

        if !triggers_new_longest_chain || longest_chain.is_empty() {
            return Ok(());
        }

        let head = block.to_ref();
        if self.filter_steps.contains(Step::Undo) {
            self.process_blocks(s, &head, &undos, Step::Undo)?;
            self.process_blocks(s, &head, &redos, Step::New)?;
        }
        self.process_new_blocks(s, &longest_chain)?;

        if !s.ensure_block_flowed {
            return Ok(());
        }
        let last_sent = match &s.last_block_sent {
            Some(last_sent) => last_sent.clone(),
            None => return Ok(()),
        };
        if !s.forkdb.has_lib() {
            return Ok(());
        }

        let asserted_lib_num = match s.forkdb.block_for_id(&last_sent.id) {
            Some(node) => node.block.lib_num,
            None => return Ok(()),
        };
        let new_lib_ref = s.forkdb.block_in_current_chain(&last_sent, asserted_lib_num);
        if new_lib_ref.is_empty() {
            // links towards the asserted LIB are not all filled yet
            return Ok(());
        }

        let (_, mut irreversible_segment, stalled_blocks) =
            s.forkdb.has_new_irreversible_segment(&new_lib_ref);
        if let Some(first) = first_irreversible_block {
            irreversible_segment.insert(0, first);
        }
        if irreversible_segment.is_empty() {
            return Ok(());
        }

        s.forkdb.move_lib(&new_lib_ref);
        let purged = s.forkdb.purge_before_lib(self.kept_final_blocks);
        if !purged.is_empty() {
            debug!("purged {} blocks below LIB {}", purged.len(), new_lib_ref);
        }

        self.process_irreversible_segment(s, &head, &irreversible_segment)?;
        self.process_blocks(s, &head, &stalled_blocks, Step::Stalled)?;
        Ok(())
    }

    fn triggers_new_longest_chain(&self, s: &State<O>, block: &Block) -> bool {
        if self.ensure_all_blocks_trigger_longest_chain {
            return true;
        }
        match &s.last_block_sent {
            None => true,
            Some(last_sent) => block.num > last_sent.num,
        }
    }

    /// Undo/redo candidates between the last sent head and the incoming
    /// block's parent, restricted to blocks actually delivered as `New`.
    fn sent_chain_switch_segments(
        &self,
        s: &State<O>,
        new_head_previous_id: &str,
    ) -> (Vec<ForkableBlock<O>>, Vec<ForkableBlock<O>>) {
        let last_sent = match &s.last_block_sent {
            Some(last_sent) => last_sent,
            None => return (Vec::new(), Vec::new()),
        };
        let (undo_ids, redo_ids) = s
            .forkdb
            .chain_switch_segments(&last_sent.id, new_head_previous_id);
        (
            self.sent_chain_segment(s, &undo_ids),
            self.sent_chain_segment(s, &redo_ids),
        )
    }

    fn sent_chain_segment(&self, s: &State<O>, ids: &[String]) -> Vec<ForkableBlock<O>> {
        ids.iter()
            .filter_map(|id| s.forkdb.block_for_id(id))
            .filter(|node| node.sent_as_new)
            .cloned()
            .collect()
    }

    fn compute_new_longest_chain(
        &self,
        s: &mut State<O>,
        block: &Arc<Block>,
    ) -> Vec<ForkableBlock<O>> {
        let mut longest = std::mem::take(&mut s.last_longest_chain);
        // Appending in place is sound only while the block extends the
        // cached tail and the LIB the cache hangs off has not moved.
        let can_append = longest
            .last()
            .map_or(false, |tail| tail.block.id == block.previous_id)
            && longest
                .first()
                .map_or(false, |root| root.block.previous_id == s.forkdb.lib_id());
        if can_append {
            if let Some(node) = s.forkdb.block_for_id(&block.id) {
                longest.push(node.clone());
            }
        } else {
            let target = self.target_chain_block(s, block);
            let (chain, _) = s.forkdb.reversible_segment(&target);
            longest = chain;
        }
        s.last_longest_chain = longest.clone();
        longest
    }

    fn target_chain_block(&self, s: &State<O>, block: &Arc<Block>) -> BlockRef {
        if !self.ensure_block_flows.is_empty() && !s.ensure_block_flowed {
            self.ensure_block_flows.clone()
        } else {
            block.to_ref()
        }
    }

    fn process_initial_inclusive_irreversible_block(
        &self,
        s: &mut State<O>,
        block: Arc<Block>,
        obj: Arc<O>,
        send: bool,
    ) -> Result<(), Error> {
        s.forkdb.add_link(block.clone(), obj);
        let node = match s.forkdb.block_for_id(&block.id) {
            Some(node) => node.clone(),
            None => return Ok(()),
        };
        let head = block.to_ref();
        if send {
            self.send(
                Step::NewIrreversible,
                &node,
                &head,
                head.clone(),
                0,
                1,
                &Arc::new(Vec::new()),
            )?;
        }
        s.forkdb.mark_sent_as_new(&block.id);
        self.block_flowed(s, &head);
        s.last_block_sent = Some(head.clone());
        s.last_lib_seen = head;
        Ok(())
    }

    fn process_new_blocks(
        &self,
        s: &mut State<O>,
        longest_chain: &[ForkableBlock<O>],
    ) -> Result<(), Error> {
        for node in longest_chain {
            if s.forkdb.is_sent_as_new(&node.block.id) {
                continue;
            }
            let head = longest_chain
                .last()
                .map(|tail| tail.block.to_ref())
                .unwrap_or_default();
            self.send(
                Step::New,
                node,
                &head,
                self.resolve_last_lib(s),
                0,
                1,
                &Arc::new(Vec::new()),
            )?;
            let block_ref = node.block.to_ref();
            s.forkdb.mark_sent_as_new(&block_ref.id);
            self.block_flowed(s, &block_ref);
            s.last_block_sent = Some(block_ref);
        }
        Ok(())
    }

    fn process_irreversible_segment(
        &self,
        s: &mut State<O>,
        head: &BlockRef,
        segment: &[ForkableBlock<O>],
    ) -> Result<(), Error> {
        if segment.is_empty() {
            return Ok(());
        }
        let batch = Arc::new(segment.to_vec());
        for (index, node) in segment.iter().enumerate() {
            // the irreversible block is its own LIB at emission time
            self.send(
                Step::Irreversible,
                node,
                head,
                node.block.to_ref(),
                index,
                segment.len(),
                &batch,
            )?;
        }
        s.last_lib_seen = segment
            .last()
            .map(|node| node.block.to_ref())
            .unwrap_or_default();
        Ok(())
    }

    fn process_blocks(
        &self,
        s: &mut State<O>,
        head: &BlockRef,
        blocks: &[ForkableBlock<O>],
        step: Step,
    ) -> Result<(), Error> {
        if blocks.is_empty() {
            return Ok(());
        }
        let batch = Arc::new(blocks.to_vec());
        for (index, node) in blocks.iter().enumerate() {
            self.send(
                step,
                node,
                head,
                self.resolve_last_lib(s),
                index,
                blocks.len(),
                &batch,
            )?;
        }
        Ok(())
    }

    fn resolve_last_lib(&self, s: &State<O>) -> BlockRef {
        if !s.last_lib_seen.is_empty() {
            s.last_lib_seen.clone()
        } else {
            s.forkdb.lib_ref().clone()
        }
    }

    fn block_flowed(&self, s: &mut State<O>, block_ref: &BlockRef) {
        if self.ensure_block_flows.is_empty() || s.ensure_block_flowed {
            return;
        }
        if block_ref.id == self.ensure_block_flows.id {
            s.ensure_block_flowed = true;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        step: Step,
        node: &ForkableBlock<O>,
        head: &BlockRef,
        last_lib_sent: BlockRef,
        step_index: usize,
        step_count: usize,
        step_blocks: &Arc<Vec<ForkableBlock<O>>>,
    ) -> Result<(), Error> {
        if !self.filter_steps.contains(step) {
            return Ok(());
        }
        let step_label = step.to_string();
        metrics::STEPS_EMITTED_TOTAL
            .with_label_values(&[step_label.as_str()])
            .inc();
        let obj = ForkableObject {
            step,
            block: node.block.clone(),
            head_block: head.clone(),
            last_lib_sent,
            obj: node.obj.clone(),
            step_index,
            step_count,
            step_blocks: step_blocks.clone(),
        };
        self.handler
            .process_block(node.block.clone(), obj)
            .map_err(Error::Handler)
    }
}

impl<O, H> Handler<O> for Forkable<O, H>
where
    O: Send + Sync + 'static,
    H: Handler<ForkableObject<O>>,
{
    fn process_block(&self, block: Arc<Block>, obj: O) -> anyhow::Result<()> {
        self.process(block, Arc::new(obj))?;
        Ok(())
    }
}
