//! Debug assertion macros for ringbuffer invariants.
//!
//! Active only in debug builds; release builds pay nothing. Used by
//! `ringbuf.rs` and the commit path in `store.rs`.

/// Assert that a live slot carries an even count (readers step by 2).
macro_rules! debug_assert_live_count {
    ($count:expr) => {
        debug_assert!(
            $count & 1 == 0,
            "live slot has odd count {} (free marker leaked into live region)",
            $count
        )
    };
}

/// Assert that a free slot carries the canonical free marker.
macro_rules! debug_assert_free_count {
    ($count:expr) => {
        debug_assert!(
            $count == 1,
            "free slot has count {} (expected the free marker 1)",
            $count
        )
    };
}

/// Assert that committed versions strictly increase.
macro_rules! debug_assert_version_advances {
    ($old:expr, $new:expr) => {
        debug_assert!(
            $new > $old,
            "commit version went from {} to {} (versions must strictly increase)",
            $old,
            $new
        )
    };
}

pub(crate) use {debug_assert_free_count, debug_assert_live_count, debug_assert_version_advances};
