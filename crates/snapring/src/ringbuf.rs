//! Lock-free registry of live snapshots.
//!
//! The ringbuffer is a circular linked list of snapshot descriptors placed
//! at the tail of the shared control block. Entries from `old_pos` through
//! `put_pos` (inclusive) are live and carry an even `count`; entries after
//! `put_pos` up to (not including) `old_pos` are free and carry the free
//! marker `1`. Readers only ever step `count` (see `counter.rs`); every
//! other field is mutated exclusively by the writer while it holds the
//! write mutex.
//!
//! # Memory ordering
//!
//! - `put_pos` is the publication point: the writer release-stores it after
//!   the new slot's payload is written and its count has been
//!   release-stored to 0. Readers acquire-load `put_pos`.
//! - `old_pos` only matters to the writer (cleanup) and to the
//!   specific-version probe, which tolerates staleness; relaxed is enough.
//! - `entries` is written while the backing file has already been grown and
//!   remapped under the write mutex; readers acquire-load it when deciding
//!   whether their own mapping must grow.
//!
//! # Growth
//!
//! The slot array is the **last** field so the ring can grow by extending
//! the lock file and remapping; the array simply continues past the
//! struct's nominal end. Every slot access therefore goes through raw
//! pointer arithmetic, with the caller vouching that its mapping covers the
//! index.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::counter;
use crate::invariants::{debug_assert_free_count, debug_assert_live_count};

/// Slots a fresh ring starts with.
pub const INITIAL_SLOTS: u32 = 32;

/// Slots added per expansion.
pub const GROWTH_STEP: u32 = 32;

/// One snapshot descriptor.
///
/// Wire layout (little-endian, repr(C)): `version: u64`, `file_size: u64`,
/// `top_ref: u64`, `count: AtomicU32`, `next: u32` (32 bytes).
///
/// The payload fields live in `UnsafeCell`s because the writer stores them
/// through a shared reference while readers may race; the `count` protocol
/// is what makes those races benign (a reader only dereferences payload it
/// acquired `count` for, and the writer only rewrites payload of slots it
/// flipped to free).
#[repr(C)]
pub struct SnapshotSlot {
    version: UnsafeCell<u64>,
    file_size: UnsafeCell<u64>,
    top_ref: UnsafeCell<u64>,
    count: AtomicU32,
    next: UnsafeCell<u32>,
}

// SAFETY: concurrent access is mediated by the count protocol documented on
// the module; the raw cells are never touched without it.
unsafe impl Send for SnapshotSlot {}
unsafe impl Sync for SnapshotSlot {}

impl SnapshotSlot {
    /// The slot's reference count / free flag.
    #[inline]
    pub fn count(&self) -> &AtomicU32 {
        &self.count
    }

    /// Reads the committed version number.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on this slot (successful
    /// [`counter::try_acquire`]) or the write mutex.
    #[inline]
    pub unsafe fn version(&self) -> u64 {
        *self.version.get()
    }

    /// Reads the logical file size recorded for this snapshot.
    ///
    /// # Safety
    ///
    /// As for [`Self::version`].
    #[inline]
    pub unsafe fn file_size(&self) -> u64 {
        *self.file_size.get()
    }

    /// Reads the top-ref recorded for this snapshot.
    ///
    /// # Safety
    ///
    /// As for [`Self::version`].
    #[inline]
    pub unsafe fn top_ref(&self) -> u64 {
        *self.top_ref.get()
    }

    /// Initializes the snapshot payload.
    ///
    /// # Safety
    ///
    /// Only the writer may call this, on a slot that is free or otherwise
    /// unreachable by readers, before publishing it.
    #[inline]
    pub unsafe fn set_payload(&self, version: u64, file_size: u64, top_ref: u64) {
        *self.version.get() = version;
        *self.file_size.get() = file_size;
        *self.top_ref.get() = top_ref;
    }

    /// # Safety
    ///
    /// Writer-only, as for [`Self::set_payload`].
    #[inline]
    unsafe fn set_next(&self, idx: u32) {
        *self.next.get() = idx;
    }

    /// # Safety
    ///
    /// Writer-only (readers never traverse the list).
    #[inline]
    unsafe fn next(&self) -> u32 {
        *self.next.get()
    }
}

/// The ringbuffer header plus its initial slot storage.
///
/// Must be the final field of the shared control block; growth happens by
/// extending the backing file past `slots` and remapping.
#[repr(C)]
pub struct Ringbuffer {
    entries: AtomicU32,
    put_pos: AtomicU32,
    old_pos: AtomicU32,
    _pad: u32,
    slots: [SnapshotSlot; INITIAL_SLOTS as usize],
}

// SAFETY: as for SnapshotSlot.
unsafe impl Send for Ringbuffer {}
unsafe impl Sync for Ringbuffer {}

impl Ringbuffer {
    /// Initializes a ring in place inside zeroed shared memory: all slots
    /// free except slot 0, which becomes the current snapshot with zero
    /// readers, linked circularly.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory covering the whole struct, with
    /// no other participant attached yet.
    pub unsafe fn init_at(this: *mut Self) {
        let ring = &*this;
        for i in 0..INITIAL_SLOTS {
            let slot = ring.slot_ptr(i);
            (*slot).set_payload(1, 0, 0);
            (*slot).count.store(1, Ordering::Relaxed);
            (*slot).set_next(i + 1);
        }
        (*ring.slot_ptr(INITIAL_SLOTS - 1)).set_next(0);
        (*ring.slot_ptr(0)).count.store(0, Ordering::Relaxed);
        ring.old_pos.store(0, Ordering::Relaxed);
        ring.entries.store(INITIAL_SLOTS, Ordering::Relaxed);
        ring.put_pos.store(0, Ordering::Release);
    }

    /// Number of slots the ring currently holds (may exceed what the
    /// caller's mapping covers; compare against a locally cached value
    /// before dereferencing).
    #[inline]
    pub fn num_entries(&self) -> u32 {
        self.entries.load(Ordering::Acquire)
    }

    /// Index of the current snapshot.
    #[inline]
    pub fn last(&self) -> u32 {
        self.put_pos.load(Ordering::Acquire)
    }

    /// Index of the oldest live snapshot.
    #[inline]
    pub fn oldest_pos(&self) -> u32 {
        self.old_pos.load(Ordering::Relaxed)
    }

    #[inline]
    fn slot_ptr(&self, idx: u32) -> *mut SnapshotSlot {
        // Computed from the struct base, not the array field: slots past
        // INITIAL_SLOTS live beyond the struct's nominal extent (the grown
        // file region), which the caller's mapping covers.
        let base = std::ptr::from_ref(self).cast::<u8>().cast_mut();
        // SAFETY: offset arithmetic only; callers vouch their mapping
        // covers slot `idx`.
        unsafe {
            base.add(mem::offset_of!(Ringbuffer, slots))
                .cast::<SnapshotSlot>()
                .add(idx as usize)
        }
    }

    /// Returns the slot at `idx`.
    ///
    /// # Safety
    ///
    /// `idx` must be below the number of entries covered by the caller's
    /// mapping of the ring.
    #[inline]
    pub unsafe fn get(&self, idx: u32) -> &SnapshotSlot {
        &*self.slot_ptr(idx)
    }

    /// Returns the oldest live slot.
    ///
    /// # Safety
    ///
    /// As for [`Self::get`].
    #[inline]
    pub unsafe fn get_oldest(&self) -> &SnapshotSlot {
        self.get(self.oldest_pos())
    }

    /// True when publishing one more snapshot would collide with the free
    /// marker that must always separate the live and free regions.
    ///
    /// # Safety
    ///
    /// Writer-only (traverses `next`); mapping must cover the current slot.
    #[inline]
    pub unsafe fn is_full(&self) -> bool {
        self.get(self.last()).next() == self.old_pos.load(Ordering::Relaxed)
    }

    /// Index the next publication will land on.
    ///
    /// # Safety
    ///
    /// Writer-only; do not call when [`Self::is_full`].
    #[inline]
    pub unsafe fn next_pos(&self) -> u32 {
        debug_assert!(!self.is_full());
        self.get(self.last()).next()
    }

    /// The slot the next publication will land on.
    ///
    /// # Safety
    ///
    /// As for [`Self::next_pos`]; mapping must cover the returned index.
    #[inline]
    pub unsafe fn get_next(&self) -> &SnapshotSlot {
        self.get(self.next_pos())
    }

    /// Re-initializes the current slot for the session's first snapshot.
    ///
    /// # Safety
    ///
    /// Only the session initiator may call this, under the control mutex,
    /// before any other participant can observe the ring.
    pub unsafe fn reinit_last(&self) -> &SnapshotSlot {
        let slot = self.get(self.last());
        // Under single-attacher protection the atomic store is immaterial;
        // the field is atomic for its concurrent life after this point.
        slot.count.store(0, Ordering::Relaxed);
        slot
    }

    /// Publishes the slot prepared at [`Self::get_next`]: flips its count
    /// from the free marker to "live, zero readers" (release) and then
    /// advances `put_pos` (release). The second release is the publication
    /// barrier readers pair their acquire with.
    ///
    /// # Safety
    ///
    /// Writer-only, payload already written via [`SnapshotSlot::set_payload`].
    pub unsafe fn publish_next(&self) {
        let next = self.next_pos();
        let slot = self.get(next);
        debug_assert_free_count!(slot.count.load(Ordering::Relaxed));
        counter::mark_used(&slot.count);
        self.put_pos.store(next, Ordering::Release);
    }

    /// Reclaims slots whose readers have all departed, advancing `old_pos`
    /// until it reaches a slot that is still referenced (or the current
    /// snapshot). Single-threaded by construction: only the writer, under
    /// the write mutex, runs cleanup.
    ///
    /// # Safety
    ///
    /// Writer-only; the mapping must cover every ring entry.
    pub unsafe fn cleanup(&self) {
        while self.old_pos.load(Ordering::Relaxed) != self.put_pos.load(Ordering::Relaxed) {
            let slot = self.get(self.old_pos.load(Ordering::Relaxed));
            if !counter::try_mark_free(&slot.count) {
                break;
            }
            self.old_pos.store(slot.next(), Ordering::Relaxed);
        }
    }

    /// Splices `new_entries - entries` freshly initialized free slots
    /// between the current snapshot and `old_pos`.
    ///
    /// # Safety
    ///
    /// Writer-only, under the write mutex, with the backing file already
    /// grown and the caller's mapping remapped to cover `new_entries`.
    pub unsafe fn expand_to(&self, new_entries: u32) {
        let entries = self.entries.load(Ordering::Relaxed);
        debug_assert!(new_entries > entries);
        for i in entries..new_entries {
            let slot = self.slot_ptr(i);
            (*slot).set_payload(1, 0, 0);
            (*slot).count.store(1, Ordering::Relaxed);
            (*slot).set_next(i + 1);
        }
        (*self.slot_ptr(new_entries - 1)).set_next(self.old_pos.load(Ordering::Relaxed));
        (*self.slot_ptr(self.put_pos.load(Ordering::Relaxed))).set_next(entries);
        self.entries.store(new_entries, Ordering::Release);
    }

    /// Bytes the ring needs beyond its initial in-struct storage to hold
    /// `entries` slots.
    #[inline]
    pub fn required_space(entries: u32) -> usize {
        mem::size_of::<SnapshotSlot>() * (entries.saturating_sub(INITIAL_SLOTS)) as usize
    }

    /// Walks the ring asserting the region invariants: live slots even,
    /// free slots exactly 1. The asserts compile away in release builds;
    /// callers are tests and debug paths.
    ///
    /// # Safety
    ///
    /// Writer-only; the mapping must cover every ring entry.
    pub unsafe fn check_regions(&self) {
        let mut i = self.old_pos.load(Ordering::Relaxed);
        let last = self.put_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.get(i);
            debug_assert_live_count!(slot.count.load(Ordering::Relaxed));
            if i == last {
                break;
            }
            i = slot.next();
        }
        let mut i = self.get(last).next();
        while i != self.old_pos.load(Ordering::Relaxed) {
            let slot = self.get(i);
            debug_assert_free_count!(slot.count.load(Ordering::Relaxed));
            i = slot.next();
        }
    }
}
