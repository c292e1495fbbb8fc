//! Dual-stride atomic helpers for snapshot slot reference counts.
//!
//! A slot counter encodes two orthogonal facts in one 32-bit atomic:
//!
//! - the reader reference count, stepped in units of **2** (so a live slot
//!   always holds an even value, `count / 2` live readers);
//! - the slot-free flag, stepped in units of **1** (an odd value means the
//!   slot is free; `count == 1` is the canonical free state).
//!
//! Either side can back out after losing a race: a reader that bumped a free
//! slot undoes its +2, a reclaimer that bumped a referenced slot undoes its
//! +1. The orderings below establish the two happens-before edges the
//! protocol needs:
//!
//! - **Acquire** on a successful reader increment pairs with the writer's
//!   **Release** store-to-0 when the slot payload was initialized, so the
//!   reader sees a consistent `{version, top_ref, file_size}`.
//! - **Release** on the reader decrement pairs with the reclaimer's
//!   **Acquire** increment-to-1, so every read of the payload completes
//!   before the slot is recycled.

use std::sync::atomic::{AtomicU32, Ordering};

/// Attempts to register a reader on a slot.
///
/// Adds 2 with acquire ordering. If the previous value was odd the slot is
/// free (or being freed) and the increment is rolled back.
///
/// Returns `true` if the slot was live and the reader now holds a reference.
#[inline]
pub fn try_acquire(counter: &AtomicU32) -> bool {
    let prev = counter.fetch_add(2, Ordering::Acquire);
    if prev & 1 == 1 {
        // Lost the race against reclamation. The rollback needs no ordering;
        // nothing was read under the failed reference.
        counter.fetch_sub(2, Ordering::Relaxed);
        return false;
    }
    true
}

/// Drops a reader reference previously obtained with [`try_acquire`].
///
/// The release ordering publishes "this reader is done with the payload" to
/// the reclaimer's acquire in [`try_mark_free`].
#[inline]
pub fn release(counter: &AtomicU32) {
    counter.fetch_sub(2, Ordering::Release);
}

/// Attempts to flip a slot from "live, zero readers" to "free".
///
/// Adds 1 with acquire ordering. If the previous value was nonzero a reader
/// still holds (or just grabbed) the slot and the flip is rolled back.
///
/// Returns `true` if the slot is now free and its payload may be recycled.
#[inline]
pub fn try_mark_free(counter: &AtomicU32) -> bool {
    let prev = counter.fetch_add(1, Ordering::Acquire);
    if prev != 0 {
        counter.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// Flips a free slot back to "live, zero readers" after its payload has been
/// initialized. The release ordering is the publication barrier for the
/// payload stores that precede it.
#[inline]
pub fn mark_used(counter: &AtomicU32) {
    counter.fetch_sub(1, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn acquire_on_live_slot() {
        let count = AtomicU32::new(0); // live, zero readers
        assert!(try_acquire(&count));
        assert_eq!(count.load(Relaxed), 2);
        assert!(try_acquire(&count));
        assert_eq!(count.load(Relaxed), 4);
        release(&count);
        release(&count);
        assert_eq!(count.load(Relaxed), 0);
    }

    #[test]
    fn acquire_on_free_slot_fails_and_rolls_back() {
        let count = AtomicU32::new(1); // free
        assert!(!try_acquire(&count));
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn mark_free_blocked_by_reader() {
        let count = AtomicU32::new(2); // one reader
        assert!(!try_mark_free(&count));
        assert_eq!(count.load(Relaxed), 2);

        release(&count);
        assert!(try_mark_free(&count));
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn used_then_freed_round_trip() {
        let count = AtomicU32::new(1);
        mark_used(&count);
        assert_eq!(count.load(Relaxed), 0);
        assert!(try_mark_free(&count));
        assert_eq!(count.load(Relaxed), 1);
    }

    #[test]
    fn contended_acquire_release_balances() {
        use std::sync::Arc;
        use std::thread;

        let count = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let count = Arc::clone(&count);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    if try_acquire(&count) {
                        release(&count);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count.load(Relaxed), 0);
    }
}
