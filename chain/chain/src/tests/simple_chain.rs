use std::time::Duration;

use assert_matches::assert_matches;

use weft_primitives::test_utils::{TestBlockBuilder, build_chain_on};
use weft_primitives::{Point, Tip};
use weft_store::{BlockComponent, ComponentValue};

use crate::error::Error;
use crate::readers::ChainUpdate;
use crate::tests::{TestEnv, wait_for_tip};

#[test]
fn build_chain() {
    let env = TestEnv::new(5);
    assert_eq!(env.db.get_tip_point(), Point::Origin);

    let blocks = build_chain_on(&Tip::genesis(), 4);
    for (i, block) in blocks.iter().enumerate() {
        let tip = env.add(block);
        assert_eq!(tip, block.point());
        assert_eq!(env.db.get_tip_block_no(), Some(i as u64));
    }

    // Anchor invariant: fragment anchored at the immutable tip.
    let fragment = env.db.get_current_chain();
    assert_eq!(fragment.anchor_point(), Point::Origin);
    assert_eq!(fragment.len(), 4);

    let ledger = env.db.get_current_ledger();
    assert_eq!(ledger.tip, blocks[3].point());
    assert_eq!(ledger.blocks_applied, 4);

    let header = env.db.get_tip_header().unwrap().unwrap();
    assert_eq!(&header, blocks[3].header());
}

#[test]
fn extension_notifies_reader() {
    let env = TestEnv::new(5);
    let blocks = build_chain_on(&Tip::genesis(), 2);
    for block in &blocks {
        env.add(block);
    }

    let mut reader = env.db.new_reader(BlockComponent::Header).unwrap();
    // Catch the reader up to the tip.
    for block in &blocks {
        let update = reader.instruction().unwrap().unwrap();
        assert_eq!(
            update,
            ChainUpdate::RollForward(
                block.point(),
                ComponentValue::Header(block.header().clone())
            )
        );
    }
    assert_eq!(reader.instruction().unwrap(), None);

    let c = TestBlockBuilder::new(blocks[1].header()).build();
    env.add(&c);
    let update = reader.instruction().unwrap().unwrap();
    assert_matches!(update, ChainUpdate::RollForward(point, _) if point == c.point());
}

#[test]
fn duplicate_add_is_a_noop() {
    let env = TestEnv::new(5);
    let block = TestBlockBuilder::from_tip(&Tip::genesis()).build();
    env.add(&block);

    // Already in the volatile pool: durable, no reprocessing.
    let (written, tip) = env.add_rejected(&block);
    assert!(written);
    assert_eq!(tip, block.point());
}

#[test]
fn invalid_block_recorded_and_never_revalidated() {
    let env = TestEnv::new(5);
    let blocks = build_chain_on(&Tip::genesis(), 2);
    for block in &blocks {
        env.add(block);
    }

    let x = TestBlockBuilder::new(blocks[1].header()).issuer(9).build();
    env.rules.reject(x.hash());

    let before = env.db.get_is_invalid_block();
    assert_eq!(before.fingerprint, 0);

    // Persisted, validated, found invalid; the chain does not move.
    let tip = env.add(&x);
    assert_eq!(tip, blocks[1].point());
    let after = env.db.get_is_invalid_block();
    assert_eq!(after.fingerprint, 1);
    assert!(after.value.contains_key(&x.hash()));

    // A chain extending the invalid block is ignored without another
    // validation round: the fingerprint stays put.
    let y = TestBlockBuilder::new(x.header()).build();
    let tip = env.add(&y);
    assert_eq!(tip, blocks[1].point());
    assert_eq!(env.db.get_is_invalid_block().fingerprint, 1);

    // Re-adding the invalid block is rejected before the queue.
    let (written, _) = env.add_rejected(&x);
    assert!(!written);
}

#[test]
fn block_older_than_k_rejected() {
    let env = TestEnv::new(5);
    let blocks = build_chain_on(&Tip::genesis(), 10);
    for block in &blocks {
        env.add(block);
    }
    // Settle everything deeper than k=5; the anchor lands on block 4.
    let copied = env.db.copy_to_immutable_now().unwrap();
    assert_eq!(copied, 5);
    assert_eq!(env.db.get_current_chain().anchor_point(), blocks[4].point());

    // A fork below the anchor can never be adopted.
    let stale = TestBlockBuilder::new(blocks[3].header()).issuer(9).build();
    let (written, tip) = env.add_rejected(&stale);
    assert!(!written);
    assert_eq!(tip, blocks[9].point());
}

#[test]
fn future_block_deferred_then_adopted() {
    let env = TestEnv::new(5);
    let blocks = build_chain_on(&Tip::genesis(), 2);
    for block in &blocks {
        env.add(block);
    }

    // Wall clock sits at slot 1000; a block two slots ahead is within the
    // skew but not yet valid.
    let early = TestBlockBuilder::new(blocks[1].header()).slot(1_002).build();
    let mut promise = env.db.add_block(early.clone());
    assert!(promise.written_to_disk().unwrap());
    assert_eq!(promise.processed().unwrap(), blocks[1].point());
    assert_eq!(env.db.get_tip_point(), blocks[1].point());

    // Its slot arrives; the worker's next tick adopts it.
    env.clock.advance(Duration::from_secs(2));
    assert!(wait_for_tip(&env.db, early.point(), Duration::from_secs(5)));
}

#[test]
fn far_future_block_marked_invalid() {
    let env = TestEnv::new(5);
    let block = TestBlockBuilder::from_tip(&Tip::genesis()).slot(1_050).build();
    let (written, tip) = env.add_rejected(&block);
    assert!(!written);
    assert_eq!(tip, Point::Origin);
    let invalid = env.db.get_is_invalid_block();
    assert_eq!(invalid.fingerprint, 1);
    assert!(invalid.value.contains_key(&block.hash()));
}

#[test]
fn boundary_block_chain_settles() {
    let env = TestEnv::new(1);
    let b1 = TestBlockBuilder::from_tip(&Tip::genesis()).slot(5).build();
    // Slot 10 starts a chunk under the test layout; the boundary block
    // sits there and its successor shares the slot.
    let boundary = TestBlockBuilder::new(b1.header()).slot(10).boundary().build();
    let b2 = TestBlockBuilder::new(boundary.header()).slot(10).build();
    let b3 = TestBlockBuilder::new(b2.header()).slot(11).build();
    for block in [&b1, &boundary, &b2, &b3] {
        env.add(block);
    }
    assert_eq!(env.db.get_tip_point(), b3.point());

    env.db.copy_to_immutable_now().unwrap();
    assert_eq!(env.db.get_current_chain().anchor_point(), b2.point());
    assert_eq!(env.db.get_block(&boundary.point()).unwrap().unwrap(), boundary);
}

#[test]
fn chain_survives_restart() {
    let env = TestEnv::new(5);
    let blocks = build_chain_on(&Tip::genesis(), 8);
    for block in &blocks {
        env.add(block);
    }
    env.db.copy_to_immutable_now().unwrap();
    let tip_before = env.db.get_tip_point();
    let ledger_before = env.db.get_current_ledger();

    let env = env.reopen();
    assert_eq!(env.db.get_tip_point(), tip_before);
    assert_eq!(env.db.get_current_ledger(), ledger_before);
    // Every block still reads back identically.
    for block in &blocks {
        assert_eq!(env.db.get_block(&block.point()).unwrap().unwrap(), *block);
    }
}

#[test]
fn closed_handle_fails_operations() {
    let env = TestEnv::new(5);
    let block = TestBlockBuilder::from_tip(&Tip::genesis()).build();
    env.add(&block);

    env.db.close();
    assert_matches!(env.db.get_block(&block.point()), Err(Error::DbClosed));
    let mut promise = env.db.add_block(TestBlockBuilder::new(block.header()).build());
    assert_matches!(promise.written_to_disk(), Err(Error::DbClosed));
    assert_matches!(
        env.db.stream(Point::Origin, block.point(), BlockComponent::Block),
        Err(Error::DbClosed)
    );
    assert_matches!(env.db.new_reader(BlockComponent::Header), Err(Error::DbClosed));
}
