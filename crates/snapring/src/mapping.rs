//! Growable memory mapping of the lock file.
//!
//! Two mappings of the same file coexist per attachment: a fixed-size one
//! covering the control-block prefix (mutexes must never move while locked)
//! and a growable one used to observe the ringbuffer, remapped whenever the
//! ring has been expanded past the locally known capacity.

use std::io;
use std::ptr;

use crate::lockfile::LockFile;

/// A shared, read-write mapping of a prefix of the lock file.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping points at file-backed shared memory; all concurrent
// access goes through atomics or pthread primitives per the control-block
// protocol.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps the first `len` bytes of `file`.
    pub fn map(file: &LockFile, len: usize) -> io::Result<Self> {
        // SAFETY:
        // - null addr lets the kernel choose placement
        // - PROT_READ|PROT_WRITE with MAP_SHARED matches the file's open mode
        // - the fd is valid for the lifetime of this call; the mapping keeps
        //   its own reference afterwards
        // - MAP_FAILED is checked below
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Replaces this mapping with a larger one of the same file.
    ///
    /// The old view is unmapped first; callers must not hold pointers into
    /// it across this call. The control-block prefix mapping is never
    /// remapped, so mutexes stay put.
    pub fn remap(&mut self, file: &LockFile, new_len: usize) -> io::Result<()> {
        let fresh = Self::map(file, new_len)?;
        let old = std::mem::replace(self, fresh);
        drop(old);
        Ok(())
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_reflects_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let mut lf = LockFile::open(&path).unwrap();
        lf.zero_fill(4096).unwrap();

        let map = Mapping::map(&lf, 4096).unwrap();
        // SAFETY: the mapping covers 4096 zeroed bytes.
        unsafe {
            assert_eq!(*map.as_ptr(), 0);
            *map.as_ptr() = 0xAB;
        }

        // A second mapping of the same file sees the store.
        let map2 = Mapping::map(&lf, 4096).unwrap();
        // SAFETY: same file, same offset, MAP_SHARED.
        unsafe {
            assert_eq!(*map2.as_ptr(), 0xAB);
        }
    }

    #[test]
    fn remap_grows_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let mut lf = LockFile::open(&path).unwrap();
        lf.zero_fill(4096).unwrap();

        let mut map = Mapping::map(&lf, 4096).unwrap();
        assert_eq!(map.len(), 4096);

        lf.prealloc(16_384).unwrap();
        map.remap(&lf, 16_384).unwrap();
        assert_eq!(map.len(), 16_384);

        // SAFETY: the grown mapping covers the byte we poke.
        unsafe {
            *map.as_ptr().add(10_000) = 0xCD;
            assert_eq!(*map.as_ptr().add(10_000), 0xCD);
        }
    }
}
