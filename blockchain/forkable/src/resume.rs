// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Read-only reconstruction of step events for clients resuming from a
//! cursor, without replaying history through the state machine.

use crate::forkable::{Forkable, ForkableObject};
use crate::forkdb::ForkableBlock;
use chainstream_blocks::{BlockRef, Cursor, Step};
use std::sync::Arc;

impl<O, H> Forkable<O, H> {
    /// Every block from `from` (inclusive) to the current head along the
    /// canonical segment, labelled `NewIrreversible` up to the LIB and
    /// `New` past it. `None` when the LIB is unknown, the head is not
    /// rooted in it, or `from` is not on the segment.
    pub fn blocks_from_final(&self, from: &BlockRef) -> Option<Vec<ForkableObject<O>>> {
        let s = self.state.read();
        if !s.forkdb.has_lib() {
            return None;
        }
        let head = s.last_longest_chain.last()?.block.to_ref();
        let (segment, reached_lib) = s.forkdb.complete_segment(&head);
        if !reached_lib {
            return None;
        }

        let lib = s.forkdb.lib_ref().clone();
        let mut out = Vec::new();
        let mut started = false;
        for node in &segment {
            if node.block.id == from.id {
                started = true;
            }
            if !started {
                continue;
            }
            let (step, last_lib_sent) = if node.block.num <= lib.num {
                (Step::NewIrreversible, node.block.to_ref())
            } else {
                (Step::New, lib.clone())
            };
            out.push(resume_object(step, node, &head, last_lib_sent));
        }
        if !started {
            return None;
        }
        Some(out)
    }

    /// The step events moving a client from `cursor` onto the current
    /// canonical chain: undos down to the junction when the cursor sits on
    /// an abandoned fork, irreversibility catch-up for blocks finalized
    /// since, then `New` up to the head. `None` when the journey cannot be
    /// reconstructed from retained blocks; the caller must then restart
    /// from a lower point.
    pub fn blocks_from_cursor(&self, cursor: &Cursor) -> Option<Vec<ForkableObject<O>>> {
        let s = self.state.read();
        if !s.forkdb.has_lib() {
            return None;
        }
        let head = s.last_longest_chain.last()?.block.to_ref();
        let (segment, reached_lib) = s.forkdb.complete_segment(&head);
        if !reached_lib || segment.is_empty() {
            return None;
        }
        let position_of = |id: &str| segment.iter().position(|node| node.block.id == id);
        let lib = s.forkdb.lib_ref().clone();

        let mut out = Vec::new();
        let mut effective = cursor.clone();

        if position_of(&cursor.block.id).is_none() {
            // The cursor is on a fork: unwind its ancestry until it lands
            // on the canonical segment. A cursor already mid-undo must not
            // see its own block undone twice.
            let mut skip_emission = cursor.step == Step::Undo;
            let mut cur_id = cursor.block.id.clone();
            let max_hops = s.forkdb.links().len() + 1;
            let mut hops = 0;
            let junction = loop {
                hops += 1;
                if hops > max_hops {
                    return None;
                }
                let node = s.forkdb.block_for_id(&cur_id)?.clone();
                if !skip_emission {
                    let last_lib_sent = if lib.num > node.block.num {
                        node.block.to_ref()
                    } else {
                        lib.clone()
                    };
                    out.push(resume_object(Step::Undo, &node, &head, last_lib_sent));
                }
                skip_emission = false;
                let previous_id = node.block.previous_id.clone();
                if let Some(pos) = position_of(&previous_id) {
                    break segment[pos].block.to_ref();
                }
                cur_id = previous_id;
            };
            effective = Cursor::new(
                Step::New,
                junction,
                cursor.head_block.clone(),
                cursor.lib.clone(),
            );
        }

        let cursor_pos = position_of(&effective.block.id)?;
        for (pos, node) in segment.iter().enumerate() {
            let num = node.block.num;
            if num <= lib.num {
                if num > effective.lib.num {
                    let step = if pos <= cursor_pos {
                        Step::Irreversible
                    } else {
                        Step::NewIrreversible
                    };
                    out.push(resume_object(step, node, &head, node.block.to_ref()));
                }
            } else if pos > cursor_pos {
                out.push(resume_object(Step::New, node, &head, lib.clone()));
            }
        }
        Some(out)
    }
}

fn resume_object<O>(
    step: Step,
    node: &ForkableBlock<O>,
    head: &BlockRef,
    last_lib_sent: BlockRef,
) -> ForkableObject<O> {
    ForkableObject {
        step,
        block: node.block.clone(),
        head_block: head.clone(),
        last_lib_sent,
        obj: node.obj.clone(),
        step_index: 0,
        step_count: 1,
        step_blocks: Arc::new(Vec::new()),
    }
}
