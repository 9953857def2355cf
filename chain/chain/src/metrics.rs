use std::sync::LazyLock;

use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

pub static BLOCKS_ADDED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("weft_chain_blocks_added_total", "Blocks accepted onto the add queue")
        .unwrap()
});

pub static BLOCKS_REJECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_chain_blocks_rejected_total",
        "Blocks rejected before reaching the add queue",
    )
    .unwrap()
});

pub static CHAIN_SWITCHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_chain_switches_total",
        "Chain selections that rolled back at least one block",
    )
    .unwrap()
});

pub static INVALID_BLOCKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("weft_chain_invalid_blocks_total", "Blocks that failed validation")
        .unwrap()
});

pub static BLOCKS_COPIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_chain_blocks_copied_total",
        "Blocks copied from the volatile pool to the immutable store",
    )
    .unwrap()
});

pub static HEAD_HEIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("weft_chain_head_height", "Block number of the current chain tip").unwrap()
});

pub static HEAD_SLOT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("weft_chain_head_slot", "Slot of the current chain tip").unwrap()
});
