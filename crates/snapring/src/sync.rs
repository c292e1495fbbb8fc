//! Process-shared, robust synchronization primitives living in mapped memory.
//!
//! The shared control block embeds three mutexes and four condition
//! variables that must work across address spaces. They wrap raw pthread
//! objects configured with `PTHREAD_PROCESS_SHARED`, and (on Linux)
//! `PTHREAD_MUTEX_ROBUST` so the death of a holder is recoverable: the next
//! acquirer observes `EOWNERDEAD`, runs a recovery callback, and marks the
//! mutex consistent before proceeding.
//!
//! These types are only ever constructed *in place* inside a file-backed
//! mapping (`init_at`), never on the Rust stack, and are never destroyed:
//! per POSIX, a process-shared mutex may outlive its initializing process
//! and may be re-initialized without an intervening destroy.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

/// A process-shared mutex that survives the death of its holder.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the wrapped pthread mutex is explicitly initialized for
// process-shared use; all access goes through pthread calls.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// Initializes a mutex in place inside shared, zeroed memory.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory of at least
    /// `size_of::<RobustMutex>()` bytes that no other participant is
    /// concurrently accessing (the caller holds the exclusive file lock
    /// during control-block initialization).
    pub unsafe fn init_at(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let attr_ptr = attr.as_mut_ptr();
        let result = (|| {
            // SAFETY: attr was initialized above; `this` is valid per the
            // function contract.
            unsafe {
                check(libc::pthread_mutexattr_setpshared(
                    attr_ptr,
                    libc::PTHREAD_PROCESS_SHARED,
                ))?;
                #[cfg(target_os = "linux")]
                check(libc::pthread_mutexattr_setrobust(
                    attr_ptr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))?;
                check(libc::pthread_mutex_init((*this).inner.get(), attr_ptr))
            }
        })();
        libc::pthread_mutexattr_destroy(attr_ptr);
        result
    }

    /// Acquires the mutex, recovering it if the previous holder died.
    ///
    /// `recover` runs before the mutex is marked consistent. For the write
    /// mutex this is a no-op: the commit protocol publishes through a single
    /// release store, so a dead writer leaves no partial state visible.
    pub fn lock(&self, recover: impl FnOnce()) -> io::Result<()> {
        // SAFETY: the mutex was initialized by `init_at` before the control
        // block was published (init_complete barrier).
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        self.after_acquire(rc, recover)
    }

    /// Releases the mutex. The caller must hold it.
    pub fn unlock(&self) {
        // SAFETY: same initialization argument as `lock`; unlock of a held
        // mutex cannot fail except through API misuse.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "unlock of robust mutex failed: {rc}");
    }

    /// Scoped acquisition; the guard releases on drop.
    pub fn lock_guard(&self, recover: impl FnOnce()) -> io::Result<RobustLockGuard<'_>> {
        self.lock(recover)?;
        Ok(RobustLockGuard { mutex: self })
    }

    /// Asks the implementation whether this mutex (possibly written by a
    /// different build) is usable at all.
    pub fn is_valid(&self) -> bool {
        // SAFETY: probing with trylock never blocks; every outcome below is
        // put back the way we found it.
        let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        match rc {
            0 => {
                self.unlock();
                true
            }
            libc::EBUSY => true,
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                // SAFETY: trylock returned EOWNERDEAD, so we hold the mutex.
                unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                self.unlock();
                true
            }
            _ => false,
        }
    }

    fn after_acquire(&self, rc: libc::c_int, recover: impl FnOnce()) -> io::Result<()> {
        match rc {
            0 => Ok(()),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                log::warn!("[sync] recovering mutex abandoned by a dead holder");
                recover();
                // SAFETY: EOWNERDEAD means we now hold the mutex and must
                // mark it consistent before unlocking.
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                check(rc)
            }
            err => {
                let _ = recover;
                Err(io::Error::from_raw_os_error(err))
            }
        }
    }

    fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

/// RAII guard for [`RobustMutex::lock_guard`].
pub struct RobustLockGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for RobustLockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A process-shared condition variable paired with a [`RobustMutex`].
#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: as for RobustMutex; initialized process-shared, accessed only via
// pthread calls.
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initializes a condition variable in place inside shared memory.
    ///
    /// # Safety
    ///
    /// Same contract as [`RobustMutex::init_at`].
    pub unsafe fn init_at(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let attr_ptr = attr.as_mut_ptr();
        let result = (|| {
            // SAFETY: attr was initialized above; `this` is valid per the
            // function contract.
            unsafe {
                check(libc::pthread_condattr_setpshared(
                    attr_ptr,
                    libc::PTHREAD_PROCESS_SHARED,
                ))?;
                check(libc::pthread_cond_init((*this).inner.get(), attr_ptr))
            }
        })();
        libc::pthread_condattr_destroy(attr_ptr);
        result
    }

    /// Waits for a signal, optionally bounded by `timeout`.
    ///
    /// The caller must hold `mutex`. Returns `true` if the wait timed out.
    /// A holder dying while we were queued surfaces as `EOWNERDEAD` on
    /// re-acquisition and is recovered exactly as in [`RobustMutex::lock`].
    pub fn wait(
        &self,
        mutex: &RobustMutex,
        recover: impl FnOnce(),
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let rc = match timeout {
            None => {
                // SAFETY: caller holds `mutex`; both objects are initialized
                // process-shared in the same control block.
                unsafe { libc::pthread_cond_wait(self.inner.get(), mutex.as_ptr()) }
            }
            Some(timeout) => {
                let deadline = absolute_deadline(timeout)?;
                // SAFETY: as above; the deadline is a valid timespec.
                unsafe {
                    libc::pthread_cond_timedwait(self.inner.get(), mutex.as_ptr(), &deadline)
                }
            }
        };
        match rc {
            0 => Ok(false),
            libc::ETIMEDOUT => Ok(true),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                log::warn!("[sync] condvar re-acquired a mutex abandoned by a dead holder");
                recover();
                // SAFETY: we hold the mutex after EOWNERDEAD.
                check(unsafe { libc::pthread_mutex_consistent(mutex.as_ptr()) })?;
                Ok(false)
            }
            err => {
                let _ = recover;
                Err(io::Error::from_raw_os_error(err))
            }
        }
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        // SAFETY: signaling an initialized condvar is always permitted.
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        // SAFETY: as for `notify_one`.
        let rc = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        debug_assert_eq!(rc, 0);
    }
}

/// Converts a relative timeout into the absolute `CLOCK_REALTIME` deadline
/// `pthread_cond_timedwait` expects.
fn absolute_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + libc::c_long::from(timeout.subsec_nanos());
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec += 1;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

#[inline]
fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Anonymous shared mapping holding a mutex, a condvar, and a word of
    /// state: the same arrangement the control block uses, minus the file.
    struct SharedPage {
        ptr: *mut u8,
        len: usize,
    }

    #[repr(C)]
    struct TestArea {
        mutex: RobustMutex,
        cond: SharedCondvar,
        word: AtomicU32,
    }

    impl SharedPage {
        fn new() -> Self {
            let len = 4096;
            // SAFETY: anonymous shared mapping with valid prot/flags; result
            // checked against MAP_FAILED below.
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(ptr, libc::MAP_FAILED);
            let page = Self {
                ptr: ptr.cast(),
                len,
            };
            // SAFETY: the fresh mapping is exclusively ours and large enough
            // for TestArea.
            unsafe {
                let area = page.area();
                RobustMutex::init_at(ptr::addr_of_mut!((*area).mutex)).unwrap();
                SharedCondvar::init_at(ptr::addr_of_mut!((*area).cond)).unwrap();
                (*area).word = AtomicU32::new(0);
            }
            page
        }

        fn area(&self) -> *mut TestArea {
            self.ptr.cast()
        }
    }

    impl Drop for SharedPage {
        fn drop(&mut self) {
            // SAFETY: unmapping the region we mapped in `new`.
            unsafe { libc::munmap(self.ptr.cast(), self.len) };
        }
    }

    #[test]
    fn lock_unlock_and_validity() {
        let page = SharedPage::new();
        // SAFETY: area outlives the references taken below.
        let area = unsafe { &*page.area() };

        area.mutex.lock(|| ()).unwrap();
        area.mutex.unlock();
        assert!(area.mutex.is_valid());
    }

    #[test]
    fn guard_releases_on_drop() {
        let page = SharedPage::new();
        // SAFETY: as above.
        let area = unsafe { &*page.area() };

        {
            let _guard = area.mutex.lock_guard(|| ()).unwrap();
        }
        // Would deadlock if the guard had not released.
        area.mutex.lock(|| ()).unwrap();
        area.mutex.unlock();
    }

    #[test]
    fn condvar_times_out() {
        let page = SharedPage::new();
        // SAFETY: as above.
        let area = unsafe { &*page.area() };

        area.mutex.lock(|| ()).unwrap();
        let start = Instant::now();
        let timed_out = area
            .cond
            .wait(&area.mutex, || (), Some(Duration::from_millis(50)))
            .unwrap();
        area.mutex.unlock();

        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn condvar_wakes_waiter() {
        // The mapping is shared with a thread; keep it alive via scope.
        let page = SharedPage::new();
        let area_ptr = page.area() as usize;

        let waiter = std::thread::spawn(move || {
            // SAFETY: the parent keeps the mapping alive until join.
            let area = unsafe { &*(area_ptr as *mut TestArea) };
            area.mutex.lock(|| ()).unwrap();
            while area.word.load(Ordering::Acquire) == 0 {
                area.cond
                    .wait(&area.mutex, || (), Some(Duration::from_secs(5)))
                    .unwrap();
            }
            area.mutex.unlock();
            area.word.load(Ordering::Acquire)
        });

        std::thread::sleep(Duration::from_millis(20));
        // SAFETY: as above.
        let area = unsafe { &*page.area() };
        area.mutex.lock(|| ()).unwrap();
        area.word.store(7, Ordering::Release);
        area.cond.notify_all();
        area.mutex.unlock();

        assert_eq!(waiter.join().unwrap(), 7);
    }

    /// Holder death is recoverable: a forked child takes the mutex and exits
    /// without unlocking; the parent's next lock observes EOWNERDEAD, runs
    /// the recovery callback, and proceeds.
    #[test]
    #[cfg(target_os = "linux")]
    fn recovery_after_holder_death() {
        let page = SharedPage::new();

        // SAFETY: fork in a test binary; the child only touches the shared
        // mapping and libc, then exits via _exit (no atexit handlers run).
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0, "fork failed");

        if pid == 0 {
            // Child: grab the mutex, record progress, die holding it.
            // SAFETY: the mapping is inherited MAP_SHARED.
            let area = unsafe { &*page.area() };
            if area.mutex.lock(|| ()).is_ok() {
                area.word.store(1, Ordering::Release);
            }
            // SAFETY: immediate termination without unwinding.
            unsafe { libc::_exit(0) };
        }

        // Parent: wait for the child to die while holding the mutex.
        let mut status = 0;
        // SAFETY: pid is our forked child.
        unsafe { libc::waitpid(pid, &mut status, 0) };

        // SAFETY: mapping still valid in the parent.
        let area = unsafe { &*page.area() };
        assert_eq!(area.word.load(Ordering::Acquire), 1, "child never locked");

        let mut recovered = false;
        area.mutex.lock(|| recovered = true).unwrap();
        area.mutex.unlock();
        assert!(recovered, "lock did not report EOWNERDEAD recovery");

        // The mutex must be fully usable afterwards.
        area.mutex.lock(|| panic!("second recovery")).unwrap();
        area.mutex.unlock();
    }
}
