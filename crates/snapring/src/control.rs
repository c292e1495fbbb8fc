//! The shared control block backing the `.lock` file.
//!
//! One instance exists per store file, shared by every attachment in the
//! session. The layout is wire-stable across participants:
//!
//! - bytes 0/1/2 are `init_complete`, `size_of_mutex`, `size_of_condvar`,
//!   so a prospective attacher can vet compatibility with a 4-byte mapping
//!   before trusting anything else;
//! - `latest_version_number` sits at offset 16 (handy under a debugger);
//! - the ringbuffer is the **last** field so growing it only extends the
//!   file (the prefix, mutexes included, never moves).

use std::io;
use std::mem;
use std::sync::atomic::{AtomicI16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::config::Durability;
use crate::ringbuf::Ringbuffer;
use crate::sync::{RobustMutex, SharedCondvar};

/// Structural version tag of this layout.
pub const LAYOUT_VERSION: u16 = 4;

/// Process-shared control block. Constructed only in place inside a zeroed
/// file mapping, under the exclusive file lock.
#[repr(C)]
pub struct SharedControl {
    /// Publication barrier: nonzero once every field below is initialized.
    init_complete: AtomicU8, // offset 0
    /// ABI self-check: size of the embedded mutex type.
    size_of_mutex: u8, // offset 1
    /// ABI self-check: size of the embedded condvar type.
    size_of_condvar: u8, // offset 2
    /// Set when a participant decides to start the async backend; cleared
    /// by the backend when it exits.
    pub daemon_started: AtomicU8, // offset 3
    /// Set by the backend once it can accept commits; participants wait on
    /// `daemon_becomes_ready` for it.
    pub daemon_ready: AtomicU8, // offset 4
    _pad0: u8,
    /// Structural version tag (must equal [`LAYOUT_VERSION`]).
    layout_version: u16, // offset 6
    /// Durability level, fixed at session creation.
    durability: u16, // offset 8
    /// Backpressure budget for async mode; guarded by `balance_mutex`.
    pub free_write_slots: AtomicI16, // offset 10
    /// Live attachments in the current session; guarded by `control_mutex`.
    pub num_participants: AtomicU32, // offset 12
    /// Last committed version; guarded by `control_mutex` (lock-free readers
    /// use the ringbuffer instead).
    pub latest_version_number: AtomicU64, // offset 16
    /// Nonzero iff the session uses encryption; other processes may not
    /// join.
    pub session_initiator_pid: AtomicU64, // offset 24
    /// Distance from the oldest live snapshot to the latest.
    pub number_of_versions: AtomicU64, // offset 32

    /// Serializes writers (and all ringbuffer mutation except counts).
    pub write_mutex: RobustMutex,
    /// Serializes the writer/backend write-slot rendezvous.
    pub balance_mutex: RobustMutex,
    /// Serializes session metadata updates.
    pub control_mutex: RobustMutex,

    /// Signaled by the backend when write slots have been refilled.
    pub room_to_write: SharedCondvar,
    /// Signaled by writers running low on slots; the backend sleeps here.
    pub work_to_do: SharedCondvar,
    /// Signaled by the backend once `daemon_ready` is set.
    pub daemon_becomes_ready: SharedCondvar,
    /// Broadcast after every commit publication.
    pub new_commit_available: SharedCondvar,

    /// The snapshot registry. MUST remain the final field.
    pub readers: Ringbuffer,
}

impl SharedControl {
    /// Byte size of the control block including the ring's initial slots.
    pub const SIZE: usize = mem::size_of::<SharedControl>();

    /// Constructs the control block in place in zeroed, exclusively held
    /// memory, leaving `init_complete` set as the final step's caller
    /// expects (the store publishes it separately after unmap-visible
    /// writes are done).
    ///
    /// # Safety
    ///
    /// `this` must point to at least [`Self::SIZE`] writable zeroed bytes
    /// that no other participant can observe yet (exclusive file lock
    /// held).
    pub unsafe fn init_at(this: *mut Self, durability: Durability) -> io::Result<()> {
        debug_assert_layout();

        std::ptr::addr_of_mut!((*this).size_of_mutex).write(mem::size_of::<RobustMutex>() as u8);
        std::ptr::addr_of_mut!((*this).size_of_condvar)
            .write(mem::size_of::<SharedCondvar>() as u8);
        std::ptr::addr_of_mut!((*this).layout_version).write(LAYOUT_VERSION);
        std::ptr::addr_of_mut!((*this).durability).write(durability.to_wire());

        RobustMutex::init_at(std::ptr::addr_of_mut!((*this).write_mutex))?;
        RobustMutex::init_at(std::ptr::addr_of_mut!((*this).balance_mutex))?;
        RobustMutex::init_at(std::ptr::addr_of_mut!((*this).control_mutex))?;

        SharedCondvar::init_at(std::ptr::addr_of_mut!((*this).room_to_write))?;
        SharedCondvar::init_at(std::ptr::addr_of_mut!((*this).work_to_do))?;
        SharedCondvar::init_at(std::ptr::addr_of_mut!((*this).daemon_becomes_ready))?;
        SharedCondvar::init_at(std::ptr::addr_of_mut!((*this).new_commit_available))?;

        Ringbuffer::init_at(std::ptr::addr_of_mut!((*this).readers));

        // The zeroed mapping already cleared the counters and flags.
        // Publish: after this store (and msync through the page cache) any
        // shared-lock holder mapping the first 4 bytes sees a complete block.
        (*this).init_complete.store(1, Ordering::Release);
        Ok(())
    }

    /// True once a (possibly foreign) initializer finished construction.
    #[inline]
    pub fn is_init_complete(&self) -> bool {
        self.init_complete.load(Ordering::Acquire) != 0
    }

    /// ABI self-check: do the primitive sizes recorded at creation match
    /// this build? Returns a description of the mismatch if not.
    pub fn validate_abi(&self) -> Result<(), String> {
        if self.size_of_mutex as usize != mem::size_of::<RobustMutex>() {
            return Err(format!(
                "mutex size {} does not match this build's {}",
                self.size_of_mutex,
                mem::size_of::<RobustMutex>()
            ));
        }
        if self.size_of_condvar as usize != mem::size_of::<SharedCondvar>() {
            return Err(format!(
                "condvar size {} does not match this build's {}",
                self.size_of_condvar,
                mem::size_of::<SharedCondvar>()
            ));
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(format!(
                "layout version {} is not the supported {LAYOUT_VERSION}",
                self.layout_version
            ));
        }
        // Sizes and tag match, but a foreign implementation may still be
        // unusable; ask a mutex to vouch for itself.
        if !self.control_mutex.is_valid() {
            return Err("control mutex failed self-validation".into());
        }
        Ok(())
    }

    /// Durability level the session was created with.
    #[inline]
    pub fn durability(&self) -> Option<Durability> {
        Durability::from_wire(self.durability)
    }

    /// Total lock-file size needed for a ring of `entries` slots.
    #[inline]
    pub fn size_for_entries(entries: u32) -> usize {
        Self::SIZE + Ringbuffer::required_space(entries)
    }
}

/// The fixed offsets other participants rely on, checked once in debug
/// builds at initialization time.
fn debug_assert_layout() {
    debug_assert_eq!(mem::offset_of!(SharedControl, init_complete), 0);
    debug_assert_eq!(mem::offset_of!(SharedControl, size_of_mutex), 1);
    debug_assert_eq!(mem::offset_of!(SharedControl, size_of_condvar), 2);
    debug_assert_eq!(mem::offset_of!(SharedControl, latest_version_number), 16);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_box() -> Vec<u64> {
        let mut buf = vec![0u64; SharedControl::SIZE.div_ceil(8)];
        // SAFETY: zeroed, u64-aligned, exclusively owned buffer of
        // SharedControl::SIZE bytes.
        unsafe {
            SharedControl::init_at(buf.as_mut_ptr().cast(), Durability::Full).unwrap();
        }
        buf
    }

    #[test]
    fn pinned_offsets() {
        assert_eq!(mem::offset_of!(SharedControl, init_complete), 0);
        assert_eq!(mem::offset_of!(SharedControl, size_of_mutex), 1);
        assert_eq!(mem::offset_of!(SharedControl, size_of_condvar), 2);
        assert_eq!(mem::offset_of!(SharedControl, daemon_started), 3);
        assert_eq!(mem::offset_of!(SharedControl, daemon_ready), 4);
        assert_eq!(mem::offset_of!(SharedControl, layout_version), 6);
        assert_eq!(mem::offset_of!(SharedControl, durability), 8);
        assert_eq!(mem::offset_of!(SharedControl, free_write_slots), 10);
        assert_eq!(mem::offset_of!(SharedControl, num_participants), 12);
        assert_eq!(mem::offset_of!(SharedControl, latest_version_number), 16);
        assert_eq!(mem::offset_of!(SharedControl, session_initiator_pid), 24);
        assert_eq!(mem::offset_of!(SharedControl, number_of_versions), 32);
    }

    #[test]
    fn ringbuffer_is_last_field() {
        assert_eq!(
            mem::offset_of!(SharedControl, readers) + mem::size_of::<Ringbuffer>(),
            SharedControl::SIZE
        );
    }

    #[test]
    fn init_publishes_and_validates() {
        let buf = control_box();
        // SAFETY: initialized by control_box; buffer outlives the reference.
        let control: &SharedControl = unsafe { &*buf.as_ptr().cast() };

        assert!(control.is_init_complete());
        assert!(control.validate_abi().is_ok());
        assert_eq!(control.durability(), Some(Durability::Full));
        assert_eq!(control.num_participants.load(Ordering::Relaxed), 0);
        assert_eq!(control.readers.last(), 0);
    }

    #[test]
    fn abi_mismatch_is_reported() {
        let mut buf = control_box();
        // Corrupt the recorded mutex size the way a foreign build would.
        // SAFETY: byte 1 is size_of_mutex.
        unsafe {
            *buf.as_mut_ptr().cast::<u8>().add(1) = 0xFF;
        }
        let control: &SharedControl = unsafe { &*buf.as_ptr().cast() };
        assert!(control.validate_abi().is_err());
    }
}
