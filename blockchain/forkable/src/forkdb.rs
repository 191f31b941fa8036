// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chainstream_blocks::{Block, BlockRef};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A block stored in the DAG together with its opaque preprocessing result
/// and the delivery bookkeeping backing at-most-once `New` emission.
#[derive(Debug)]
pub struct ForkableBlock<O> {
    pub block: Arc<Block>,
    pub obj: Arc<O>,
    pub sent_as_new: bool,
}

impl<O> Clone for ForkableBlock<O> {
    fn clone(&self) -> Self {
        Self {
            block: self.block.clone(),
            obj: self.obj.clone(),
            sent_as_new: self.sent_as_new,
        }
    }
}

impl<O> ForkableBlock<O> {
    pub fn new(block: Arc<Block>, obj: Arc<O>) -> Self {
        Self {
            block,
            obj,
            sent_as_new: false,
        }
    }
}

/// In-memory DAG of recently seen blocks. Nodes are values keyed by id;
/// edges are `previous_id` strings resolved through lookup, so purging a
/// node never leaves a dangling pointer. Traversals are bounded by the map
/// size, which doubles as the cycle guard.
///
/// `ForkDb` has no internal locking; the enclosing [`crate::Forkable`]
/// imposes the concurrency discipline.
pub struct ForkDb<O> {
    links: HashMap<String, String>,
    nums: HashMap<String, u64>,
    objects: HashMap<String, ForkableBlock<O>>,
    lib_ref: BlockRef,
}

impl<O> Default for ForkDb<O> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
            nums: HashMap::new(),
            objects: HashMap::new(),
            lib_ref: BlockRef::empty(),
        }
    }
}

impl<O> ForkDb<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        links: HashMap<String, String>,
        nums: HashMap<String, u64>,
        objects: HashMap<String, ForkableBlock<O>>,
        lib_ref: BlockRef,
    ) -> Self {
        Self {
            links,
            nums,
            objects,
            lib_ref,
        }
    }

    pub(crate) fn links(&self) -> &HashMap<String, String> {
        &self.links
    }

    pub(crate) fn nums(&self) -> &HashMap<String, u64> {
        &self.nums
    }

    pub(crate) fn objects(&self) -> &HashMap<String, ForkableBlock<O>> {
        &self.objects
    }

    /// Inserts the block into the DAG. Returns true when the id was already
    /// known, in which case nothing is modified.
    pub fn add_link(&mut self, block: Arc<Block>, obj: Arc<O>) -> bool {
        if self.links.contains_key(&block.id) {
            return true;
        }
        self.links
            .insert(block.id.clone(), block.previous_id.clone());
        self.nums.insert(block.id.clone(), block.num);
        self.objects
            .insert(block.id.clone(), ForkableBlock::new(block, obj));
        false
    }

    pub fn has_lib(&self) -> bool {
        !self.lib_ref.is_empty()
    }

    pub fn lib_ref(&self) -> &BlockRef {
        &self.lib_ref
    }

    pub fn lib_num(&self) -> u64 {
        self.lib_ref.num
    }

    pub fn lib_id(&self) -> &str {
        &self.lib_ref.id
    }

    /// Resolves the ancestor of `block` numbered `lib_num` by following
    /// `previous_id` links and makes it the LIB. If the ancestor is not
    /// linked yet the LIB stays empty; a later block will try again.
    pub fn set_lib(&mut self, block: &BlockRef, previous_id: &str, lib_num: u64) {
        if block.num == lib_num {
            self.lib_ref = block.clone();
            return;
        }

        let mut cur = previous_id.to_string();
        for _ in 0..=self.links.len() {
            let num = match self.nums.get(&cur) {
                Some(num) => *num,
                None => return, // ancestor not linked yet
            };
            if num == lib_num {
                self.lib_ref = BlockRef::new(cur, num);
                return;
            }
            if num < lib_num {
                return; // walked past it; the chain skips that number
            }
            cur = match self.links.get(&cur) {
                Some(prev) => prev.clone(),
                None => return,
            };
        }
        warn!("cycle detected while resolving LIB ancestor of {block}");
    }

    /// Monotonically advances the LIB. Callers must ensure `has_lib()` and
    /// `new_lib.num >= lib_ref.num`.
    pub fn move_lib(&mut self, new_lib: &BlockRef) {
        debug_assert!(new_lib.num >= self.lib_ref.num);
        self.lib_ref = new_lib.clone();
    }

    /// Removes every node numbered below `lib - kept_final_blocks` and
    /// returns the purged ids. Purged nodes are irrecoverable.
    pub fn purge_before_lib(&mut self, kept_final_blocks: u64) -> Vec<String> {
        let cutoff = self.lib_ref.num.saturating_sub(kept_final_blocks);
        let purged: Vec<String> = self
            .nums
            .iter()
            .filter(|(_, num)| **num < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &purged {
            self.links.remove(id);
            self.nums.remove(id);
            self.objects.remove(id);
        }
        purged
    }

    /// Walks parents from `head` collecting nodes until the LIB (excluded)
    /// or a missing parent. The chain comes back ordered oldest to `head`,
    /// along with whether the LIB was reached. Fails closed to an empty
    /// chain when the walk drops below the LIB without meeting it (a fork
    /// rooted in abandoned history, or a dangling parent once a LIB is
    /// known) or when the cycle guard trips.
    pub fn reversible_segment(&self, head: &BlockRef) -> (Vec<ForkableBlock<O>>, bool) {
        let lib_num = self.lib_ref.num;
        let max_hops = self.links.len() + 1;
        let mut chain = Vec::new();
        let mut reached_lib = false;
        let mut cur_id = head.id.clone();
        let mut cur_num = head.num;
        loop {
            if cur_num < lib_num {
                return (Vec::new(), false);
            }
            if self.has_lib() && cur_id == self.lib_ref.id {
                reached_lib = true;
                break;
            }
            let node = match self.objects.get(&cur_id) {
                Some(node) => node,
                None => break, // unlinked root boundary
            };
            chain.push(node.clone());
            if chain.len() > max_hops {
                warn!("cycle detected walking segment from {head}");
                return (Vec::new(), false);
            }
            cur_id = match self.links.get(&cur_id) {
                Some(prev) => prev.clone(),
                None => break,
            };
            // an unknown parent counts as numbered zero, which fails the
            // walk closed on the next turn once a LIB exists
            cur_num = self.nums.get(&cur_id).copied().unwrap_or(0);
        }
        chain.reverse();
        (chain, reached_lib)
    }

    /// The full retained path from `head` down to the oldest linked
    /// ancestor, LIB and below-LIB history included. `reached_lib` reports
    /// whether the LIB lies on that path; cursor resumption relies on the
    /// below-LIB suffix to reconstruct journeys inside the retention
    /// window.
    pub fn complete_segment(&self, head: &BlockRef) -> (Vec<ForkableBlock<O>>, bool) {
        if self.has_lib() && head.num < self.lib_ref.num {
            return (Vec::new(), false);
        }

        let mut chain = Vec::new();
        let mut reached_lib = false;
        let mut cur = head.id.clone();
        let max_hops = self.links.len() + 1;
        loop {
            if self.has_lib() && cur == self.lib_ref.id {
                reached_lib = true;
            }
            let node = match self.objects.get(&cur) {
                Some(node) => node,
                None => break,
            };
            chain.push(node.clone());
            if chain.len() > max_hops {
                warn!("cycle detected walking complete segment from {head}");
                return (Vec::new(), false);
            }
            cur = match self.links.get(&cur) {
                Some(prev) => prev.clone(),
                None => break,
            };
        }
        chain.reverse();
        (chain, reached_lib)
    }

    /// Walks from `head` towards the LIB and returns the ref of the node
    /// numbered `num`, or the empty ref when the path does not contain it.
    pub fn block_in_current_chain(&self, head: &BlockRef, num: u64) -> BlockRef {
        let mut cur = head.clone();
        for _ in 0..=self.links.len() {
            if cur.num == num {
                return cur;
            }
            if cur.num < num {
                return BlockRef::empty();
            }
            let prev = match self.links.get(&cur.id) {
                Some(prev) => prev,
                None => return BlockRef::empty(),
            };
            let prev_num = match self.nums.get(prev) {
                Some(num) => *num,
                None => return BlockRef::empty(),
            };
            cur = BlockRef::new(prev.clone(), prev_num);
        }
        warn!("cycle detected walking chain from {head}");
        BlockRef::empty()
    }

    /// Finds the lowest common ancestor of two heads. `undo_ids` come back
    /// in head-to-junction order (most recent first), `redo_ids` in
    /// junction-to-head order (oldest first); the junction itself is in
    /// neither.
    pub fn chain_switch_segments(
        &self,
        old_head_id: &str,
        new_head_id: &str,
    ) -> (Vec<String>, Vec<String>) {
        let max_hops = self.links.len() + 1;

        let mut old_chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = old_head_id.to_string();
        loop {
            if cur.is_empty() || old_chain.len() > max_hops {
                break;
            }
            old_chain.push(cur.clone());
            seen.insert(cur.clone());
            cur = match self.links.get(&cur) {
                Some(prev) => prev.clone(),
                None => break,
            };
        }

        let mut redos_reversed = Vec::new();
        let mut junction = None;
        let mut cur = new_head_id.to_string();
        loop {
            if cur.is_empty() || redos_reversed.len() > max_hops {
                break;
            }
            if seen.contains(&cur) {
                junction = Some(cur);
                break;
            }
            redos_reversed.push(cur.clone());
            cur = match self.links.get(&cur) {
                Some(prev) => prev.clone(),
                None => break,
            };
        }

        let undos = match junction {
            Some(junction) => old_chain
                .into_iter()
                .take_while(|id| *id != junction)
                .collect(),
            None => old_chain,
        };
        redos_reversed.reverse();
        (undos, redos_reversed)
    }

    /// Given a candidate LIB known to lie on the current chain, returns the
    /// nodes between the current LIB (exclusive) and `new_lib` (inclusive),
    /// oldest first, plus every node at or below `new_lib` off that path
    /// that will now never become irreversible.
    pub fn has_new_irreversible_segment(
        &self,
        new_lib: &BlockRef,
    ) -> (bool, Vec<ForkableBlock<O>>, Vec<ForkableBlock<O>>) {
        if self.lib_ref.id == new_lib.id {
            return (false, Vec::new(), Vec::new());
        }

        let old_lib_num = self.lib_ref.num;
        let mut segment = Vec::new();
        let mut cur = new_lib.id.clone();
        let max_hops = self.links.len() + 1;
        loop {
            if cur == self.lib_ref.id {
                break;
            }
            let node = match self.objects.get(&cur) {
                Some(node) => node,
                None => return (false, Vec::new(), Vec::new()),
            };
            if node.block.num <= old_lib_num {
                // not actually linked to the current LIB
                return (false, Vec::new(), Vec::new());
            }
            segment.push(node.clone());
            if segment.len() > max_hops {
                warn!("cycle detected walking irreversible segment to {new_lib}");
                return (false, Vec::new(), Vec::new());
            }
            cur = match self.links.get(&cur) {
                Some(prev) => prev.clone(),
                None => return (false, Vec::new(), Vec::new()),
            };
        }
        if segment.is_empty() {
            return (false, Vec::new(), Vec::new());
        }
        segment.reverse();

        let in_segment: HashSet<&str> = segment.iter().map(|n| n.block.id.as_str()).collect();
        let mut stalled: Vec<ForkableBlock<O>> = self
            .objects
            .values()
            .filter(|node| {
                node.block.num > old_lib_num
                    && node.block.num <= new_lib.num
                    && !in_segment.contains(node.block.id.as_str())
            })
            .cloned()
            .collect();
        stalled.sort_by(|a, b| (a.block.num, &a.block.id).cmp(&(b.block.num, &b.block.id)));

        (true, segment, stalled)
    }

    pub fn block_for_id(&self, id: &str) -> Option<&ForkableBlock<O>> {
        self.objects.get(id)
    }

    pub(crate) fn mark_sent_as_new(&mut self, id: &str) {
        if let Some(node) = self.objects.get_mut(id) {
            node.sent_as_new = true;
        }
    }

    pub(crate) fn is_sent_as_new(&self, id: &str) -> bool {
        self.objects.get(id).map_or(false, |node| node.sent_as_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_test_utils::{make_block, make_ref};

    fn db_with_chain() -> ForkDb<()> {
        // G <- b1 <- b2 <- b3 <- b4
        //             \- b3x <- b4x
        let mut db = ForkDb::new();
        let unit = Arc::new(());
        for blk in [
            make_block("b1", 1, "G", 0),
            make_block("b2", 2, "b1", 0),
            make_block("b3", 3, "b2", 0),
            make_block("b4", 4, "b3", 0),
            make_block("b3x", 3, "b2", 0),
            make_block("b4x", 4, "b3x", 0),
        ] {
            assert!(!db.add_link(blk, unit.clone()));
        }
        db
    }

    #[test]
    fn add_link_reports_existing() {
        let mut db = db_with_chain();
        assert!(db.add_link(make_block("b2", 2, "bogus", 0), Arc::new(())));
        // the original link is untouched
        assert_eq!(db.links().get("b2").unwrap(), "b1");
    }

    #[test]
    fn set_lib_resolves_linked_ancestor() {
        let mut db = db_with_chain();
        assert!(!db.has_lib());
        db.set_lib(&make_ref("b4", 4), "b3", 2);
        assert!(db.has_lib());
        assert_eq!(db.lib_ref(), &make_ref("b2", 2));
    }

    #[test]
    fn set_lib_on_self() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b1", 1), "G", 1);
        assert_eq!(db.lib_ref(), &make_ref("b1", 1));
    }

    #[test]
    fn set_lib_with_unlinked_ancestor_stays_empty() {
        let mut db: ForkDb<()> = ForkDb::new();
        db.add_link(make_block("b9", 9, "b8", 0), Arc::new(()));
        db.set_lib(&make_ref("b9", 9), "b8", 5);
        assert!(!db.has_lib());
    }

    #[test]
    fn reversible_segment_stops_below_lib() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 2);
        let (chain, reached) = db.reversible_segment(&make_ref("b4", 4));
        assert!(reached);
        let ids: Vec<&str> = chain.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b4"]);
        assert_eq!(chain[0].block.previous_id, "b2"); // first element hangs off the LIB
    }

    #[test]
    fn reversible_segment_without_lib_reaches_root() {
        let db = db_with_chain();
        let (chain, reached) = db.reversible_segment(&make_ref("b4", 4));
        assert!(!reached);
        let ids: Vec<&str> = chain.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3", "b4"]);
    }

    #[test]
    fn reversible_segment_fails_closed_below_lib() {
        let mut db = db_with_chain();
        db.add_link(make_block("b2x", 2, "b1", 0), Arc::new(()));
        db.add_link(make_block("b3y", 3, "b2x", 0), Arc::new(()));
        db.set_lib(&make_ref("b4", 4), "b3", 3);
        // b3y forks below the LIB through b2x
        let (chain, reached) = db.reversible_segment(&make_ref("b3y", 3));
        assert!(chain.is_empty());
        assert!(!reached);
    }

    #[test]
    fn reversible_segment_survives_malformed_cycle() {
        let mut db: ForkDb<()> = ForkDb::new();
        db.add_link(make_block("x1", 10, "x2", 0), Arc::new(()));
        db.add_link(make_block("x2", 11, "x1", 0), Arc::new(()));
        let (chain, reached) = db.reversible_segment(&make_ref("x2", 11));
        assert!(chain.is_empty());
        assert!(!reached);
    }

    #[test]
    fn complete_segment_includes_lib_and_retained_history() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 2);
        let (chain, reached) = db.complete_segment(&make_ref("b4", 4));
        assert!(reached);
        let ids: Vec<&str> = chain.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3", "b4"]);

        db.purge_before_lib(0);
        let (chain, reached) = db.complete_segment(&make_ref("b4", 4));
        assert!(reached);
        let ids: Vec<&str> = chain.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(ids, vec!["b2", "b3", "b4"]);
    }

    #[test]
    fn block_in_current_chain_walks_to_number() {
        let db = db_with_chain();
        assert_eq!(
            db.block_in_current_chain(&make_ref("b4x", 4), 2),
            make_ref("b2", 2)
        );
        assert_eq!(
            db.block_in_current_chain(&make_ref("b4", 4), 4),
            make_ref("b4", 4)
        );
        assert!(db.block_in_current_chain(&make_ref("b4", 4), 5).is_empty());
    }

    #[test]
    fn chain_switch_segments_find_junction() {
        let db = db_with_chain();
        let (undos, redos) = db.chain_switch_segments("b4", "b4x");
        assert_eq!(undos, vec!["b4".to_string(), "b3".to_string()]);
        assert_eq!(redos, vec!["b3x".to_string(), "b4x".to_string()]);
    }

    #[test]
    fn chain_switch_segments_are_symmetric() {
        let db = db_with_chain();
        let (undos_ab, redos_ab) = db.chain_switch_segments("b4", "b4x");
        let (undos_ba, redos_ba) = db.chain_switch_segments("b4x", "b4");
        let mut reversed_redos_ab = redos_ab.clone();
        reversed_redos_ab.reverse();
        let mut reversed_undos_ab = undos_ab.clone();
        reversed_undos_ab.reverse();
        assert_eq!(undos_ba, reversed_redos_ab);
        assert_eq!(redos_ba, reversed_undos_ab);
    }

    #[test]
    fn new_irreversible_segment_with_stalled_sibling() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 1);
        let (has_new, segment, stalled) = db.has_new_irreversible_segment(&make_ref("b3", 3));
        assert!(has_new);
        let seg_ids: Vec<&str> = segment.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(seg_ids, vec!["b2", "b3"]);
        let stalled_ids: Vec<&str> = stalled.iter().map(|n| n.block.id.as_str()).collect();
        assert_eq!(stalled_ids, vec!["b3x"]);
    }

    #[test]
    fn new_irreversible_segment_is_noop_on_same_lib() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 2);
        let (has_new, segment, stalled) = db.has_new_irreversible_segment(&make_ref("b2", 2));
        assert!(!has_new);
        assert!(segment.is_empty());
        assert!(stalled.is_empty());
    }

    #[test]
    fn purge_keeps_retention_window() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 3);
        let mut purged = db.purge_before_lib(1);
        purged.sort();
        assert_eq!(purged, vec!["b1".to_string()]);
        assert!(db.block_for_id("b2").is_some());
        assert!(db.block_for_id("b1").is_none());

        let purged = db.purge_before_lib(0);
        assert_eq!(purged, vec!["b2".to_string()]);
    }

    #[test]
    fn lib_moves_monotonically() {
        let mut db = db_with_chain();
        db.set_lib(&make_ref("b4", 4), "b3", 1);
        db.move_lib(&make_ref("b2", 2));
        assert_eq!(db.lib_num(), 2);
        db.move_lib(&make_ref("b3", 3));
        assert_eq!(db.lib_num(), 3);
    }
}
