// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use chainstream_blocks::{Block, Handler, Step};
use chainstream_forkable::{Error, Forkable, ForkableObject};
use chainstream_test_utils::{make_block, make_ref, CollectingHandler};
use std::collections::HashSet;
use std::sync::Arc;

type TestHandler = Arc<CollectingHandler<ForkableObject<()>>>;

fn new_forkable(handler: TestHandler) -> Forkable<(), TestHandler> {
    Forkable::new(handler)
}

fn feed(forkable: &Forkable<(), TestHandler>, blocks: &[Arc<Block>]) {
    for block in blocks {
        forkable
            .process_block(block.clone(), ())
            .unwrap_or_else(|e| panic!("feeding {block}: {e}"));
    }
}

fn emissions(handler: &CollectingHandler<ForkableObject<()>>) -> Vec<String> {
    handler
        .received()
        .iter()
        .map(|(block, obj)| format!("{}:{}", obj.step, block.id))
        .collect()
}

/// `New` may only repeat for an id after an intervening `Undo`, and `Undo`
/// must always follow a delivery.
fn assert_delivery_discipline(handler: &CollectingHandler<ForkableObject<()>>) {
    let mut live: HashSet<String> = HashSet::new();
    for (block, obj) in handler.received() {
        match obj.step {
            Step::New | Step::NewIrreversible => {
                assert!(
                    live.insert(block.id.clone()),
                    "{} delivered twice without an undo",
                    block.id
                );
            }
            Step::Undo => {
                assert!(
                    live.remove(&block.id),
                    "undo of {} without a prior delivery",
                    block.id
                );
            }
            Step::Irreversible | Step::Stalled => {}
        }
    }
}

fn assert_cursors_roundtrip(handler: &CollectingHandler<ForkableObject<()>>) {
    for (_, obj) in handler.received() {
        let cursor = obj.cursor();
        let reparsed = cursor
            .to_string()
            .parse()
            .unwrap_or_else(|e| panic!("cursor {cursor} does not round-trip: {e}"));
        assert_eq!(cursor, reparsed);
    }
}

fn linear_chain() -> Vec<Arc<Block>> {
    vec![
        make_block("b1", 1, "G", 1),
        make_block("b2", 2, "b1", 1),
        make_block("b3", 3, "b2", 2),
        make_block("b4", 4, "b3", 3),
    ]
}

#[test]
fn linear_chain_emits_news_and_irreversibles() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());

    assert_eq!(
        emissions(&handler),
        vec![
            "new_irreversible:b1",
            "new:b2",
            "new:b3",
            "irreversible:b2",
            "new:b4",
            "irreversible:b3",
        ]
    );
    assert_eq!(forkable.lib(), make_ref("b3", 3));
    assert_delivery_discipline(&handler);
    assert_cursors_roundtrip(&handler);
}

#[test]
fn irreversible_emission_stays_at_or_below_lib() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());

    let lib = forkable.lib();
    for (block, obj) in handler.received() {
        if obj.step.is_irreversible() {
            assert!(block.num <= lib.num);
        }
    }
}

/// A fork at equal height does not win; the switch happens once the fork
/// becomes the strictly longest chain.
#[test]
fn fork_switches_once_strictly_longer() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(
        &forkable,
        &[
            make_block("b1", 1, "G", 1),
            make_block("b2", 2, "b1", 1),
            make_block("b3", 3, "b2", 1),
            make_block("b4", 4, "b3", 2),
        ],
    );
    let before_fork = handler.len();

    // same-height sibling and its child: no switch yet
    feed(
        &forkable,
        &[
            make_block("b3x", 3, "b2", 2),
            make_block("b4x", 4, "b3x", 2),
        ],
    );
    assert_eq!(handler.len(), before_fork);

    // the fork takes the lead
    feed(&forkable, &[make_block("b5x", 5, "b4x", 2)]);
    assert_eq!(
        emissions(&handler)[before_fork..],
        [
            "undo:b4".to_string(),
            "undo:b3".to_string(),
            "new:b3x".to_string(),
            "new:b4x".to_string(),
            "new:b5x".to_string(),
        ]
    );
    assert_delivery_discipline(&handler);
    assert_cursors_roundtrip(&handler);
}

#[test]
fn undo_batches_carry_step_metadata() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(
        &forkable,
        &[
            make_block("b1", 1, "G", 1),
            make_block("b2", 2, "b1", 1),
            make_block("b3", 3, "b2", 1),
            make_block("b4", 4, "b3", 1),
            make_block("b3x", 3, "b2", 1),
            make_block("b4x", 4, "b3x", 1),
            make_block("b5x", 5, "b4x", 1),
        ],
    );

    let undos: Vec<ForkableObject<()>> = handler
        .received()
        .into_iter()
        .filter(|(_, obj)| obj.step == Step::Undo)
        .map(|(_, obj)| obj)
        .collect();
    assert_eq!(undos.len(), 2);
    assert_eq!(undos[0].step_index, 0);
    assert_eq!(undos[0].step_count, 2);
    assert_eq!(undos[1].step_index, 1);
    assert_eq!(undos[1].step_count, 2);
    // most recent first, and the shared batch lists both
    assert_eq!(undos[0].block.id, "b4");
    assert_eq!(undos[1].block.id, "b3");
    let batch_ids: Vec<&str> = undos[0]
        .step_blocks
        .iter()
        .map(|node| node.block.id.as_str())
        .collect();
    assert_eq!(batch_ids, vec!["b4", "b3"]);
}

/// With every block re-evaluating the longest chain, the switch happens as
/// soon as the fork ties the height of the abandoned head.
#[test]
fn fork_switches_eagerly_when_all_blocks_trigger() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone())
        .include_initial_lib()
        .ensure_all_blocks_trigger_longest_chain();
    feed(
        &forkable,
        &[
            make_block("b1", 1, "G", 1),
            make_block("b2", 2, "b1", 1),
            make_block("b3", 3, "b2", 1),
            make_block("b4", 4, "b3", 2),
        ],
    );
    let before_fork = handler.len();

    feed(&forkable, &[make_block("b3x", 3, "b2", 2)]);
    assert_eq!(
        emissions(&handler)[before_fork..],
        [
            "undo:b4".to_string(),
            "undo:b3".to_string(),
            "new:b3x".to_string(),
        ]
    );
    assert_delivery_discipline(&handler);
}

/// Switching back to a previously abandoned branch re-delivers its blocks
/// as `New` even though they were sent before.
#[test]
fn switch_back_redelivers_previous_branch() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(
        &forkable,
        &[
            make_block("b1", 1, "G", 1),
            make_block("b2", 2, "b1", 1),
            make_block("b3a", 3, "b2", 1),
            make_block("b4a", 4, "b3a", 1),
            make_block("b3b", 3, "b2", 1),
            make_block("b4b", 4, "b3b", 1),
            make_block("b5b", 5, "b4b", 1),
        ],
    );
    let before_switch_back = handler.len();

    feed(
        &forkable,
        &[
            make_block("b5a", 5, "b4a", 1),
            make_block("b6a", 6, "b5a", 1),
        ],
    );
    assert_eq!(
        emissions(&handler)[before_switch_back..],
        [
            "undo:b5b".to_string(),
            "undo:b4b".to_string(),
            "undo:b3b".to_string(),
            "new:b3a".to_string(),
            "new:b4a".to_string(),
            "new:b5a".to_string(),
            "new:b6a".to_string(),
        ]
    );
    assert_delivery_discipline(&handler);
}

#[test]
fn below_lib_replay_is_ignored() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());
    let settled = handler.len();

    feed(&forkable, &[make_block("b2", 2, "b1", 1)]);
    assert_eq!(handler.len(), settled);
}

#[test]
fn replaying_the_stream_emits_nothing_new() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());
    let settled = emissions(&handler);

    feed(&forkable, &linear_chain());
    assert_eq!(emissions(&handler), settled);
}

#[test]
fn self_parenting_block_is_invalid_data() {
    let handler: TestHandler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone());
    let err = forkable
        .process(make_block("bx", 5, "bx", 4), Arc::new(()))
        .unwrap_err();
    assert!(matches!(err, Error::SelfReference(_)));
    assert!(handler.is_empty());
}

#[test]
fn filtered_steps_are_computed_but_suppressed() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone())
        .include_initial_lib()
        .with_filters(Step::New.into());
    feed(&forkable, &linear_chain());

    assert_eq!(emissions(&handler), vec!["new:b2", "new:b3", "new:b4"]);
    // the LIB still advanced even though its steps were suppressed
    assert_eq!(forkable.lib(), make_ref("b3", 3));
}

#[test]
fn hold_blocks_until_lib_withholds_emission() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).hold_blocks_until_lib();

    feed(
        &forkable,
        &[make_block("b1", 1, "G", 0), make_block("b2", 2, "b1", 0)],
    );
    assert!(handler.is_empty());

    // the first block asserting a resolvable LIB opens the gate
    feed(&forkable, &[make_block("b3", 3, "b2", 2)]);
    assert_eq!(emissions(&handler), vec!["new:b3", "irreversible:b2"]);
}

#[test]
fn ensure_block_flows_pins_the_chain_target() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).ensure_block_flows(make_ref("b3", 3));

    feed(
        &forkable,
        &[make_block("b1", 1, "G", 1), make_block("b2", 2, "b1", 1)],
    );
    // nothing flows until the designated block is seen
    assert!(handler.is_empty());

    feed(
        &forkable,
        &[make_block("b3", 3, "b2", 1), make_block("b4", 4, "b3", 2)],
    );
    assert_eq!(
        emissions(&handler),
        vec!["new:b2", "new:b3", "new:b4", "irreversible:b2"]
    );
}

#[test]
fn unlinkable_flood_aborts_the_stream() {
    let handler: TestHandler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone());
    feed(&forkable, &[make_block("b1", 1, "G", 1)]);

    for i in 0..20 {
        let id = format!("u{i}");
        let parent = format!("zz{i}");
        forkable
            .process(make_block(&id, 10 + i, &parent, 1), Arc::new(()))
            .unwrap();
    }
    let err = forkable
        .process(make_block("u20", 30, "zz20", 1), Arc::new(()))
        .unwrap_err();
    assert!(matches!(err, Error::UnlinkableFlood { count: 21, .. }));
}

#[test]
fn handler_error_aborts_and_propagates() {
    let handler = CollectingHandler::failing_at(3);
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(
        &forkable,
        &[make_block("b1", 1, "G", 1), make_block("b2", 2, "b1", 1)],
    );
    let err = forkable
        .process(make_block("b3", 3, "b2", 1), Arc::new(()))
        .unwrap_err();
    assert!(matches!(err, Error::Handler(_)));
    assert_eq!(emissions(&handler), vec!["new_irreversible:b1", "new:b2"]);
}

#[test]
fn blocks_from_final_labels_by_lib() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());

    let resumed = forkable.blocks_from_final(&make_ref("b2", 2)).unwrap();
    let labels: Vec<String> = resumed
        .iter()
        .map(|obj| format!("{}:{}", obj.step, obj.block.id))
        .collect();
    assert_eq!(labels, vec!["new_irreversible:b2", "new_irreversible:b3", "new:b4"]);
    for obj in &resumed {
        assert!(obj.last_lib_sent.num <= obj.block.num);
    }

    assert!(forkable.blocks_from_final(&make_ref("nope", 2)).is_none());
}

#[test]
fn blocks_from_cursor_on_the_canonical_chain() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());

    // a client that stopped at b2 when b2 was the head and b1 the LIB
    let cursor = chainstream_blocks::Cursor::new(
        Step::New,
        make_ref("b2", 2),
        make_ref("b2", 2),
        make_ref("b1", 1),
    );
    let resumed = forkable.blocks_from_cursor(&cursor).unwrap();
    let labels: Vec<String> = resumed
        .iter()
        .map(|obj| format!("{}:{}", obj.step, obj.block.id))
        .collect();
    assert_eq!(
        labels,
        vec!["irreversible:b2", "new_irreversible:b3", "new:b4"]
    );
}

#[test]
fn blocks_from_cursor_at_head_with_stale_lib() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(&forkable, &linear_chain());

    let cursor = chainstream_blocks::Cursor::new(
        Step::New,
        make_ref("b4", 4),
        make_ref("b4", 4),
        make_ref("b2", 2),
    );
    let resumed = forkable.blocks_from_cursor(&cursor).unwrap();
    let labels: Vec<String> = resumed
        .iter()
        .map(|obj| format!("{}:{}", obj.step, obj.block.id))
        .collect();
    // irreversible-only catch-up
    assert_eq!(labels, vec!["irreversible:b3"]);
}

#[test]
fn blocks_from_cursor_unwinds_an_abandoned_fork() {
    let handler = CollectingHandler::new();
    let forkable = new_forkable(handler.clone()).include_initial_lib();
    feed(
        &forkable,
        &[
            make_block("b1", 1, "G", 1),
            make_block("b2", 2, "b1", 1),
            make_block("b3", 3, "b2", 1),
            make_block("b4", 4, "b3", 2),
            make_block("b3x", 3, "b2", 2),
            make_block("b4x", 4, "b3x", 2),
            make_block("b5x", 5, "b4x", 2),
        ],
    );

    // a client still sitting on the abandoned b4
    let cursor = chainstream_blocks::Cursor::new(
        Step::New,
        make_ref("b4", 4),
        make_ref("b4", 4),
        make_ref("b1", 1),
    );
    let resumed = forkable.blocks_from_cursor(&cursor).unwrap();
    let labels: Vec<String> = resumed
        .iter()
        .map(|obj| format!("{}:{}", obj.step, obj.block.id))
        .collect();
    assert_eq!(
        labels,
        vec![
            "undo:b4",
            "undo:b3",
            "irreversible:b2",
            "new:b3x",
            "new:b4x",
            "new:b5x",
        ]
    );

    // a cursor already mid-undo does not see its block undone twice
    let cursor = chainstream_blocks::Cursor::new(
        Step::Undo,
        make_ref("b4", 4),
        make_ref("b5x", 5),
        make_ref("b1", 1),
    );
    let resumed = forkable.blocks_from_cursor(&cursor).unwrap();
    assert_eq!(resumed[0].step, Step::Undo);
    assert_eq!(resumed[0].block.id, "b3");

    // an unknown ancestry cannot be reconstructed
    let cursor = chainstream_blocks::Cursor::new(
        Step::New,
        make_ref("vanished", 4),
        make_ref("vanished", 4),
        make_ref("b1", 1),
    );
    assert!(forkable.blocks_from_cursor(&cursor).is_none());
}
