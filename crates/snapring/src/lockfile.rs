//! The `.lock` file: advisory-locked backing store for the shared control
//! block.
//!
//! The open protocol takes an exclusive `flock` while initializing the
//! control block, then downgrades to a shared lock held for the lifetime of
//! the attachment. The async backend additionally watches for the file
//! being unlinked out from under it (an operator's hint to shut down).

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Handle on the `.lock` file with advisory-lock helpers.
pub struct LockFile {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl LockFile {
    /// Opens (creating if necessary) the lock file for read/write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            locked: false,
        })
    }

    /// Attempts a non-blocking exclusive advisory lock.
    ///
    /// Success means no other attachment currently exists and the caller may
    /// (re)initialize the control block.
    pub fn try_lock_exclusive(&mut self) -> io::Result<bool> {
        match self.flock(libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                self.locked = true;
                Ok(true)
            }
            Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Takes (blocking) a shared advisory lock, retained for the lifetime of
    /// the attachment.
    pub fn lock_shared(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_SH)?;
        self.locked = true;
        Ok(())
    }

    /// Drops whichever advisory lock is held.
    pub fn unlock(&mut self) {
        if self.locked {
            let _ = self.flock(libc::LOCK_UN);
            self.locked = false;
        }
    }

    fn flock(&self, op: libc::c_int) -> io::Result<()> {
        // SAFETY: flock on a valid owned descriptor.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Overwrites the first `len` bytes with zeroes (control-block reset
    /// during first-attacher initialization).
    pub fn zero_fill(&mut self, len: usize) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        const CHUNK: usize = 4096;
        let zeroes = [0u8; CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(CHUNK);
            self.file.write_all(&zeroes[..n])?;
            remaining -= n;
        }
        self.file.flush()
    }

    /// Ensures the file is at least `len` bytes long, allocating real blocks
    /// so a later store through the mapping cannot hit `SIGBUS` on a full
    /// disk.
    pub fn prealloc(&self, len: u64) -> io::Result<()> {
        let len = i64::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock file too large"))?;
        // SAFETY: posix_fallocate on a valid owned descriptor.
        let rc = unsafe { libc::posix_fallocate(self.file.as_raw_fd(), 0, len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns `true` if the file has been unlinked while we hold it open
    /// (link count dropped to zero).
    pub fn is_removed(&self) -> bool {
        // SAFETY: zeroed stat buffer is a valid out-parameter for fstat.
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            libc::fstat(self.file.as_raw_fd(), &mut st) == 0 && st.st_nlink == 0
        }
    }

    /// Raw descriptor for mmap.
    pub fn raw_fd(&self) -> libc::c_int {
        self.file.as_raw_fd()
    }

    /// Path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_then_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let mut first = LockFile::open(&path).unwrap();
        assert!(first.try_lock_exclusive().unwrap());

        // A second handle cannot take the exclusive lock...
        let mut second = LockFile::open(&path).unwrap();
        assert!(!second.try_lock_exclusive().unwrap());

        // ...but can share once the first downgrades.
        first.unlock();
        first.lock_shared().unwrap();
        second.lock_shared().unwrap();
    }

    #[test]
    fn zero_fill_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let mut lf = LockFile::open(&path).unwrap();
        lf.zero_fill(10_000).unwrap();
        assert_eq!(lf.size().unwrap(), 10_000);
    }

    #[test]
    fn prealloc_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let lf = LockFile::open(&path).unwrap();
        lf.prealloc(65_536).unwrap();
        assert!(lf.size().unwrap() >= 65_536);
    }

    #[test]
    fn removal_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");

        let lf = LockFile::open(&path).unwrap();
        assert!(!lf.is_removed());

        std::fs::remove_file(&path).unwrap();
        assert!(lf.is_removed());
    }
}
