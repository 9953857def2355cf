use std::sync::LazyLock;

use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

pub static IMMUTABLE_BLOCKS_APPENDED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_immutable_blocks_appended_total",
        "Blocks appended to the immutable store since node start",
    )
    .unwrap()
});

pub static IMMUTABLE_CHUNKS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("weft_immutable_chunks", "Chunk files in the immutable store").unwrap()
});

pub static VOLATILE_BLOCKS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("weft_volatile_blocks", "Blocks currently in the volatile pool").unwrap()
});

pub static VOLATILE_SEGMENTS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("weft_volatile_segments", "Segment files backing the volatile pool")
        .unwrap()
});

pub static LEDGER_SNAPSHOTS_WRITTEN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "weft_ledger_snapshots_written_total",
        "Ledger snapshots written to disk since node start",
    )
    .unwrap()
});
