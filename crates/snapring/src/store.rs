//! The shared store: session lifecycle, transaction state machine, and the
//! commit pipeline.
//!
//! A [`SharedStore`] is one attachment onto a session. The first attacher
//! initializes the shared control block under an exclusive file lock; every
//! attacher then holds a shared lock for its lifetime. Readers pin
//! snapshots through the lock-free ringbuffer; the single writer (holder of
//! the write mutex) serializes the new payload, publishes it to the ring,
//! and reclaims slots abandoned by departed readers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::Backoff;

use crate::config::{Durability, OpenOptions};
use crate::control::SharedControl;
use crate::counter;
use crate::error::{Error, Result};
use crate::invariants::debug_assert_version_advances;
use crate::lockfile::LockFile;
use crate::mapping::Mapping;
use crate::pager::{AttachConfig, Pager};
use crate::replication::Replication;
use crate::ringbuf::{Ringbuffer, GROWTH_STEP};

/// Identifies a pinned snapshot: the version number plus the ring index it
/// was pinned at, so the same slot can be probed again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionId {
    /// Committed version number.
    pub version: u64,
    /// Ring slot index the snapshot was observed in.
    pub index: u32,
}

/// Transaction stage of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactStage {
    Ready,
    Reading,
    Writing,
}

/// The snapshot this attachment currently holds a reference on.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadLock {
    pub version: u64,
    pub reader_idx: u32,
    pub top_ref: u64,
    pub file_size: u64,
}

/// Recovery callback for the shared mutexes: nothing to do. Commits publish
/// through a single release store and file writes are either complete
/// before publication or unreachable, so a dead holder leaves no partial
/// state visible.
pub(crate) fn recover_from_dead_writer() {}

/// One attachment onto a shared, multi-version store.
///
/// ```no_run
/// use snapring::{OpenOptions, SharedStore};
///
/// let mut store = SharedStore::open("example.db", OpenOptions::durable())?;
/// let payload = store.begin_write()?;
/// payload.extend_from_slice(&42u64.to_le_bytes());
/// let version = store.commit()?;
/// assert_eq!(version, 2);
/// # Ok::<(), snapring::Error>(())
/// ```
impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

pub struct SharedStore {
    db_path: PathBuf,
    lock_file: LockFile,
    /// Fixed-size mapping of the control-block prefix. Never remapped, so
    /// the mutexes inside never move.
    control_map: Arc<Mapping>,
    /// Growable mapping used to observe the ringbuffer.
    reader_map: Mapping,
    /// Ring capacity the reader mapping is known to cover.
    local_max_entries: u32,
    pager: Pager,
    replication: Option<Box<dyn Replication>>,
    repl_in_transact: bool,
    /// Payload bound while a transaction is open.
    workspace: Vec<u8>,
    read_lock: ReadLock,
    stage: TransactStage,
    durability: Durability,
    encryption_key: Option<Vec<u8>>,
    is_backend: bool,
    max_write_slots: i16,
    relaxed_sync_threshold: i16,
    wait_for_change_enabled: Arc<AtomicBool>,
    attached: bool,
}

impl SharedStore {
    /// Opens an attachment, initializing the session if this is the first
    /// attacher. On error the file is left closed: no partial attachment
    /// escapes.
    pub fn open(path: impl AsRef<Path>, opts: OpenOptions) -> Result<Self> {
        Self::open_internal(path.as_ref(), opts, None)
    }

    /// As [`Self::open`], wiring a replication log into the commit
    /// pipeline.
    pub fn open_with_replication(
        path: impl AsRef<Path>,
        opts: OpenOptions,
        replication: Box<dyn Replication>,
    ) -> Result<Self> {
        Self::open_internal(path.as_ref(), opts, Some(replication))
    }

    fn open_internal(
        path: &Path,
        opts: OpenOptions,
        mut replication: Option<Box<dyn Replication>>,
    ) -> Result<Self> {
        let db_path = path.to_path_buf();
        let lockfile_path = lockfile_path(path);

        // Retry until the lock file is both valid and stable: the previous
        // initializer may have crashed mid-construction, detectable as an
        // unset init_complete under the shared lock.
        let mut store = loop {
            let mut lock_file =
                LockFile::open(&lockfile_path).map_err(|e| Error::from_io(e, &lockfile_path))?;

            if lock_file
                .try_lock_exclusive()
                .map_err(|e| Error::from_io(e, &lockfile_path))?
            {
                // Alone in the world: (re)initialize the control block.
                lock_file
                    .zero_fill(SharedControl::SIZE)
                    .map_err(|e| Error::from_io(e, &lockfile_path))?;
                let map = Mapping::map(&lock_file, SharedControl::SIZE)?;
                // SAFETY: freshly zeroed mapping of SharedControl::SIZE
                // bytes, exclusively held via the file lock.
                unsafe {
                    SharedControl::init_at(map.as_ptr().cast(), opts.durability)?;
                }
                drop(map);
                lock_file.unlock();
                log::debug!("[store] initialized control block for {}", db_path.display());
            }

            // Hold the shared lock from here until the attachment closes.
            lock_file
                .lock_shared()
                .map_err(|e| Error::from_io(e, &lockfile_path))?;

            // The initializer may have died before us: the file must at
            // least contain the compatibility prologue.
            let size = lock_file
                .size()
                .map_err(|e| Error::from_io(e, &lockfile_path))?;
            if usize::try_from(size).is_err() {
                return Err(Error::Range);
            }
            if size < 4 {
                continue;
            }

            {
                // Vet the prologue under a minimal mapping before trusting
                // the rest of the layout.
                let probe = Mapping::map(&lock_file, 4)?;
                // SAFETY: byte 0 is the init_complete publication flag; the
                // mapping covers 4 bytes.
                let init_complete =
                    unsafe { (*probe.as_ptr().cast::<AtomicU8>()).load(Ordering::Acquire) };
                if init_complete == 0 {
                    continue;
                }
            }

            let control_map = Arc::new(Mapping::map(&lock_file, SharedControl::SIZE)?);
            let control_ptr = control_map.as_ptr().cast::<SharedControl>();
            // SAFETY: init_complete was observed, so the full block is
            // constructed; the mapping (kept alive in the store) covers it.
            let control = unsafe { &*control_ptr };
            // init_complete only ever changes under the exclusive file
            // lock, and we observed it under the shared lock.
            debug_assert!(control.is_init_complete());
            control
                .validate_abi()
                .map_err(Error::IncompatibleLockFile)?;

            let session_durability = control
                .durability()
                .ok_or_else(|| Error::IncompatibleLockFile("unknown durability tag".into()))?;
            if session_durability != opts.durability {
                return Err(Error::InconsistentDurability {
                    session: session_durability,
                    requested: opts.durability,
                });
            }

            let _guard = control
                .control_mutex
                .lock_guard(recover_from_dead_writer)?;

            let begin_new_session = control.num_participants.load(Ordering::Relaxed) == 0;

            let mut pager = Pager::new(&db_path);
            let attach_cfg = AttachConfig {
                session_initiator: begin_new_session,
                // Only the session initiator may create the data file.
                no_create: if begin_new_session { opts.no_create } else { true },
                // A leftover MemOnly file belongs to a crashed session.
                clear_file: opts.durability == Durability::MemOnly && begin_new_session,
                allow_file_format_upgrade: opts.allow_file_format_upgrade,
                encryption_key: opts.encryption_key.as_deref(),
            };
            let info = pager.attach(&attach_cfg)?;

            if begin_new_session {
                if let Some(repl) = replication.as_mut() {
                    repl.reset_log_management(info.version);
                }
                if opts.encryption_key.is_some() {
                    control
                        .session_initiator_pid
                        .store(u64::from(std::process::id()), Ordering::Relaxed);
                }
                control
                    .latest_version_number
                    .store(info.version, Ordering::Relaxed);
                // SAFETY: session initiator under the control mutex; no
                // other participant can observe the ring yet.
                unsafe {
                    let slot = control.readers.reinit_last();
                    slot.set_payload(info.version, info.file_size, info.top_ref);
                }
                log::info!(
                    "[store] session started for {} at version {}",
                    db_path.display(),
                    info.version
                );
            } else if opts.encryption_key.is_some()
                && control.session_initiator_pid.load(Ordering::Relaxed)
                    != u64::from(std::process::id())
            {
                return Err(Error::EncryptedSharingUnsupported {
                    path: db_path.display().to_string(),
                });
            }

            let reader_map = Mapping::map(&lock_file, SharedControl::SIZE)?;

            // Make our presence noted; from here on every exit path goes
            // through close().
            control.num_participants.fetch_add(1, Ordering::Relaxed);
            control.number_of_versions.store(1, Ordering::Relaxed);

            let mut store = SharedStore {
                db_path: db_path.clone(),
                lock_file,
                control_map,
                reader_map,
                local_max_entries: 0,
                pager,
                replication: replication.take(),
                repl_in_transact: false,
                workspace: Vec::new(),
                read_lock: ReadLock::default(),
                stage: TransactStage::Ready,
                durability: opts.durability,
                encryption_key: opts.encryption_key.clone(),
                is_backend: opts.is_backend,
                max_write_slots: opts.max_write_slots,
                relaxed_sync_threshold: opts.relaxed_sync_threshold,
                wait_for_change_enabled: Arc::new(AtomicBool::new(true)),
                attached: true,
            };

            // Track the latest version so has_changed() works before the
            // first transaction.
            // SAFETY: control mutex held; the current slot lies in the
            // initial mapping.
            store.read_lock.version = unsafe {
                let ring = &*store.reader_ring_ptr();
                ring.get(ring.last()).version()
            };

            break store;
        };

        // In async mode, make sure the backend is running before we accept
        // writes. Done outside the open-protocol lock scope so an error
        // here unwinds through the normal close path.
        if store.durability == Durability::Async && !store.is_backend {
            store.ensure_backend_running()?;
        }
        Ok(store)
    }

    /// Starts (if necessary) the async backend and waits for it to become
    /// ready. Waiting on the condvar releases the control mutex so the
    /// backend's own open can proceed.
    fn ensure_backend_running(&mut self) -> Result<()> {
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        let _guard = control
            .control_mutex
            .lock_guard(recover_from_dead_writer)?;
        while control.daemon_ready.load(Ordering::Acquire) == 0 {
            if control.daemon_started.load(Ordering::Acquire) == 0 {
                control.daemon_started.store(1, Ordering::Release);
                let mut backend_opts = OpenOptions::async_commits()
                    .with_no_create(true)
                    .with_write_slots(self.max_write_slots, self.relaxed_sync_threshold);
                backend_opts.encryption_key = self.encryption_key.clone();
                crate::daemon::spawn(self.db_path.clone(), backend_opts.backend());
            }
            control.daemon_becomes_ready.wait(
                &control.control_mutex,
                recover_from_dead_writer,
                Some(Duration::from_millis(100)),
            )?;
        }
        Ok(())
    }

    /// Closes the attachment: rolls back or ends any open transaction,
    /// detaches the data file, and, as the last leaver, tears the session
    /// down (deleting a MemOnly file, stopping replication).
    pub fn close(mut self) {
        self.do_close();
    }

    fn do_close(&mut self) {
        if !self.attached {
            return;
        }
        match self.stage {
            TransactStage::Ready => {}
            TransactStage::Reading => {
                let _ = self.end_read();
            }
            TransactStage::Writing => {
                let _ = self.rollback();
            }
        }

        // SAFETY: control mapping is live until `attached` flips below.
        let control = unsafe { &*self.control_ptr() };
        if let Ok(_guard) = control.control_mutex.lock_guard(recover_from_dead_writer) {
            let before = control.num_participants.fetch_sub(1, Ordering::Relaxed);
            if before == 1 {
                // Session end.
                if self.durability == Durability::MemOnly {
                    self.pager.remove_file();
                }
                if let Some(repl) = self.replication.as_mut() {
                    repl.stop_logging();
                }
                log::info!("[store] session ended for {}", self.db_path.display());
            }
        }

        self.pager.detach();
        self.lock_file.unlock();
        self.attached = false;
    }

    // ---------------------------------------------------------------------
    // TRANSACTION STATE MACHINE
    // ---------------------------------------------------------------------

    /// Begins a read transaction on the latest snapshot, or on a specific
    /// pinned version.
    ///
    /// Returns the payload bound to the snapshot. Fails with
    /// [`Error::BadVersion`] if a requested version has been reclaimed or
    /// lies before the attachment's current position.
    pub fn begin_read(&mut self, version: Option<VersionId>) -> Result<&[u8]> {
        self.ensure_attached()?;
        if self.stage != TransactStage::Ready {
            return Err(Error::WrongTransactionState);
        }
        self.do_begin_read(version)?;
        self.stage = TransactStage::Reading;
        Ok(&self.workspace)
    }

    /// Ends a read transaction. A no-op while `Ready`.
    pub fn end_read(&mut self) -> Result<()> {
        match self.stage {
            TransactStage::Ready => Ok(()), // idempotency
            TransactStage::Reading => {
                self.do_end_read();
                self.stage = TransactStage::Ready;
                Ok(())
            }
            TransactStage::Writing => Err(Error::WrongTransactionState),
        }
    }

    /// Begins a write transaction: takes the write mutex (queueing behind
    /// other writers, and in async mode behind the backend's write-slot
    /// budget) and binds the latest snapshot for mutation.
    pub fn begin_write(&mut self) -> Result<&mut Vec<u8>> {
        self.ensure_attached()?;
        if self.stage != TransactStage::Ready {
            return Err(Error::WrongTransactionState);
        }

        self.do_begin_write()?;

        // Holding the write mutex, the latest snapshot cannot move under
        // us; the implicit read below binds it.
        let mut read_bound = false;
        let begun: Result<()> = (|| {
            self.do_begin_read(None)?;
            read_bound = true;
            if let Some(repl) = self.replication.as_mut() {
                repl.initiate_transact(self.read_lock.version)?;
                self.repl_in_transact = true;
            }
            Ok(())
        })();
        if let Err(err) = begun {
            if read_bound {
                self.do_end_read();
            }
            self.do_end_write();
            return Err(err);
        }

        self.stage = TransactStage::Writing;
        Ok(&mut self.workspace)
    }

    /// Commits the write transaction, returning the new version number.
    ///
    /// On error the transaction is still open; the caller must
    /// [`Self::rollback`].
    pub fn commit(&mut self) -> Result<u64> {
        if self.stage != TransactStage::Writing {
            return Err(Error::WrongTransactionState);
        }
        let new_version = self.do_commit()?;
        self.do_end_write();
        self.do_end_read();
        self.stage = TransactStage::Ready;
        Ok(new_version)
    }

    /// Abandons the write transaction. A no-op while `Ready`.
    pub fn rollback(&mut self) -> Result<()> {
        match self.stage {
            TransactStage::Ready => Ok(()), // idempotency
            TransactStage::Writing => {
                self.do_end_write();
                self.do_end_read();
                if self.repl_in_transact {
                    if let Some(repl) = self.replication.as_mut() {
                        repl.abort_transact();
                    }
                    self.repl_in_transact = false;
                }
                self.stage = TransactStage::Ready;
                Ok(())
            }
            TransactStage::Reading => Err(Error::WrongTransactionState),
        }
    }

    /// Payload of the currently bound snapshot.
    pub fn data(&self) -> Result<&[u8]> {
        match self.stage {
            TransactStage::Ready => Err(Error::WrongTransactionState),
            _ => Ok(&self.workspace),
        }
    }

    /// `{version, ring index}` of the snapshot bound by the current
    /// transaction, suitable for re-pinning later.
    pub fn version_of_current_transaction(&self) -> Result<VersionId> {
        match self.stage {
            TransactStage::Ready => Err(Error::WrongTransactionState),
            _ => Ok(VersionId {
                version: self.read_lock.version,
                index: self.read_lock.reader_idx,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // VERSION OBSERVATION
    // ---------------------------------------------------------------------

    /// Latest committed version, observed lock-free through the ring.
    pub fn current_version(&mut self) -> Result<u64> {
        self.ensure_attached()?;
        // Another thread may publish or clean up concurrently, so the
        // current entry is pinned just long enough to read its version.
        loop {
            let idx = loop {
                // SAFETY: ring pointer valid while attached.
                let idx = unsafe { (*self.reader_ring_ptr()).last() };
                if !self.grow_reader_mapping(idx)? {
                    break idx;
                }
            };
            // SAFETY: the mapping covers idx after grow_reader_mapping.
            let slot = unsafe { (*self.reader_ring_ptr()).get(idx) };
            if !counter::try_acquire(slot.count()) {
                continue;
            }
            // SAFETY: reference held via the count.
            let version = unsafe { slot.version() };
            counter::release(slot.count());
            return Ok(version);
        }
    }

    /// Whether a commit has been published past this attachment's last
    /// observed version.
    pub fn has_changed(&mut self) -> Result<bool> {
        let version = self.current_version()?;
        Ok(self.read_lock.version != version)
    }

    /// Number of distinct versions currently alive (oldest to latest).
    pub fn number_of_versions(&mut self) -> Result<u64> {
        self.ensure_attached()?;
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        let _guard = control
            .control_mutex
            .lock_guard(recover_from_dead_writer)?;
        Ok(control.number_of_versions.load(Ordering::Relaxed))
    }

    /// Blocks until a version newer than the bound one is committed, or
    /// until waiting is disabled. Returns whether something changed.
    pub fn wait_for_change(&mut self) -> Result<bool> {
        self.ensure_attached()?;
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        let _guard = control
            .control_mutex
            .lock_guard(recover_from_dead_writer)?;
        while self.read_lock.version == control.latest_version_number.load(Ordering::Relaxed)
            && self.wait_for_change_enabled.load(Ordering::Relaxed)
        {
            control.new_commit_available.wait(
                &control.control_mutex,
                recover_from_dead_writer,
                None,
            )?;
        }
        Ok(self.read_lock.version != control.latest_version_number.load(Ordering::Relaxed))
    }

    /// Disables [`Self::wait_for_change`] and wakes current waiters.
    pub fn wait_for_change_release(&mut self) {
        if !self.attached {
            return;
        }
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        if let Ok(_guard) = control.control_mutex.lock_guard(recover_from_dead_writer) {
            self.wait_for_change_enabled.store(false, Ordering::Relaxed);
            control.new_commit_available.notify_all();
        }
    }

    /// Re-arms [`Self::wait_for_change`] after a release.
    pub fn enable_wait_for_change(&mut self) {
        if !self.attached {
            return;
        }
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        if let Ok(_guard) = control.control_mutex.lock_guard(recover_from_dead_writer) {
            self.wait_for_change_enabled.store(true, Ordering::Relaxed);
        }
    }

    /// Handle for releasing a waiter from another thread.
    pub fn wait_release_handle(&self) -> WaitForChangeRelease {
        WaitForChangeRelease {
            enabled: Arc::clone(&self.wait_for_change_enabled),
            control_map: Arc::clone(&self.control_map),
        }
    }

    // ---------------------------------------------------------------------
    // MAINTENANCE
    // ---------------------------------------------------------------------

    /// Rewrites the data file to hold only the current snapshot.
    ///
    /// Requires this to be the only attachment; returns `false` (changing
    /// nothing) otherwise.
    pub fn compact(&mut self) -> Result<bool> {
        self.ensure_attached()?;
        if self.stage != TransactStage::Ready {
            return Err(Error::WrongTransactionState);
        }

        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        let _guard = control
            .control_mutex
            .lock_guard(recover_from_dead_writer)?;
        if control.num_participants.load(Ordering::Relaxed) > 1 {
            return Ok(false);
        }

        // Bind the current snapshot so we rewrite exactly the latest entry.
        let (lock, _) = self.grab_latest_snapshot()?;
        let payload = match self.pager.read_payload(lock.top_ref) {
            Ok(payload) => payload,
            Err(err) => {
                self.release_lock(&lock);
                return Err(err);
            }
        };
        debug_assert_eq!(
            lock.version,
            control.latest_version_number.load(Ordering::Relaxed)
        );
        self.release_lock(&lock);

        let tmp_path = compaction_path(&self.db_path);
        self.pager.detach();
        self.pager
            .write_compacted(&tmp_path, &payload, lock.version)?;
        let info = self.pager.attach(&AttachConfig {
            session_initiator: true,
            no_create: true,
            clear_file: false,
            allow_file_format_upgrade: true,
            encryption_key: self.encryption_key.as_deref(),
        })?;

        // Update the current ring entry to match the rewritten file. Safe
        // against readers because we are the only attachment.
        // SAFETY: single participant, control mutex held; the current slot
        // is mapped.
        unsafe {
            let ring = &*self.reader_ring_ptr();
            let slot = ring.get(ring.last());
            debug_assert_eq!(slot.version(), lock.version);
            slot.set_payload(lock.version, info.file_size, info.top_ref);
        }
        log::info!(
            "[store] compacted {} at version {}",
            self.db_path.display(),
            lock.version
        );
        Ok(true)
    }

    /// Grows the data-file allocation ahead of bulk writes.
    pub fn reserve(&mut self, size: u64) -> Result<()> {
        self.ensure_attached()?;
        self.pager.reserve(size)
    }

    // ---------------------------------------------------------------------
    // SNAPSHOT GRAB / RELEASE (readers' hot path)
    // ---------------------------------------------------------------------

    /// Pins the latest snapshot. Returns the lock and whether it names the
    /// same version as the attachment's previous one.
    pub(crate) fn grab_latest_snapshot(&mut self) -> Result<(ReadLock, bool)> {
        let backoff = Backoff::new();
        loop {
            // SAFETY: ring pointer valid while attached.
            let idx = unsafe { (*self.reader_ring_ptr()).last() };
            if self.grow_reader_mapping(idx)? {
                // Remapping takes time; retry with a fresh entry.
                continue;
            }
            // SAFETY: mapping covers idx.
            let slot = unsafe { (*self.reader_ring_ptr()).get(idx) };
            // The entry may have been recycled by cleanup between the
            // put_pos load and here; extremely unlikely, so just retry.
            if !counter::try_acquire(slot.count()) {
                backoff.spin();
                continue;
            }
            // SAFETY: reference held via the count.
            let lock = unsafe {
                ReadLock {
                    version: slot.version(),
                    reader_idx: idx,
                    top_ref: slot.top_ref(),
                    file_size: slot.file_size(),
                }
            };
            let same = lock.version == self.read_lock.version;
            return Ok((lock, same));
        }
    }

    /// Pins the snapshot a [`VersionId`] names, if its slot still carries
    /// that version. Returns `None` when it is gone.
    fn grab_specific_snapshot(&mut self, wanted: VersionId) -> Result<Option<ReadLock>> {
        loop {
            let idx = wanted.index;
            if self.grow_reader_mapping(idx)? {
                if idx >= self.local_max_entries {
                    // Still out of range after covering the whole ring: the
                    // index was never a valid position.
                    return Ok(None);
                }
                continue;
            }
            // SAFETY: mapping covers idx (checked above).
            let slot = unsafe { (*self.reader_ring_ptr()).get(idx) };
            loop {
                if counter::try_acquire(slot.count()) {
                    break;
                }
                // Failure means the slot is free, or the cleanup pass is
                // probing it right now. If the oldest-pointer still rests
                // on this index the probe may yet fail and leave the slot
                // live, so retry; otherwise the version is gone.
                // SAFETY: the ring header lies in the always-mapped prefix.
                if unsafe { (*self.reader_ring_ptr()).oldest_pos() } != idx {
                    return Ok(None);
                }
            }
            // Pinned an entry, but it may have been recycled for a newer
            // version since the caller recorded the id.
            // SAFETY: reference held via the count.
            let version = unsafe { slot.version() };
            if version != wanted.version {
                counter::release(slot.count());
                return Ok(None);
            }
            // SAFETY: as above.
            let lock = unsafe {
                ReadLock {
                    version,
                    reader_idx: idx,
                    top_ref: slot.top_ref(),
                    file_size: slot.file_size(),
                }
            };
            return Ok(Some(lock));
        }
    }

    /// Drops the reference a [`ReadLock`] holds.
    pub(crate) fn release_lock(&self, lock: &ReadLock) {
        // SAFETY: the lock was grabbed through this attachment, so the
        // mapping covers its index.
        let slot = unsafe { (*self.reader_ring_ptr()).get(lock.reader_idx) };
        counter::release(slot.count());
    }

    fn do_begin_read(&mut self, version: Option<VersionId>) -> Result<()> {
        let lock = match version {
            None => self.grab_latest_snapshot()?.0,
            Some(wanted) => {
                // Moving backwards in time is not supported.
                if wanted.version < self.read_lock.version {
                    return Err(Error::BadVersion);
                }
                self.grab_specific_snapshot(wanted)?
                    .ok_or(Error::BadVersion)?
            }
        };
        match self.pager.read_payload(lock.top_ref) {
            Ok(payload) => {
                self.workspace = payload;
                self.read_lock = lock;
                Ok(())
            }
            Err(err) => {
                self.release_lock(&lock);
                Err(err)
            }
        }
    }

    fn do_end_read(&mut self) {
        let lock = self.read_lock;
        self.release_lock(&lock);
        self.workspace = Vec::new();
    }

    // ---------------------------------------------------------------------
    // WRITE PATH
    // ---------------------------------------------------------------------

    fn do_begin_write(&mut self) -> Result<()> {
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };

        // The write-slot rendezvous runs before queueing on the write
        // mutex: a slot-starved writer must not hold the mutex, or the
        // backend could never reach its refill pass.
        if self.durability == Durability::Async && !self.is_backend {
            self.throttle_async_write(control)?;
        }

        // Held until commit() or rollback().
        control.write_mutex.lock(recover_from_dead_writer)?;
        Ok(())
    }

    /// Async-mode backpressure: each commit consumes a write slot; the
    /// backend refills them as it drains commits to disk.
    fn throttle_async_write(&self, control: &SharedControl) -> Result<()> {
        control.balance_mutex.lock(recover_from_dead_writer)?;
        let result = (|| {
            // Running low: kick the backend awake.
            if control.free_write_slots.load(Ordering::Relaxed) < self.relaxed_sync_threshold {
                control.work_to_do.notify_one();
            }
            // Out of slots: wait for the backend to catch up.
            while control.free_write_slots.load(Ordering::Relaxed) <= 0 {
                control.room_to_write.wait(
                    &control.balance_mutex,
                    recover_from_dead_writer,
                    None,
                )?;
            }
            control.free_write_slots.fetch_sub(1, Ordering::Relaxed);
            Ok(())
        })();
        control.balance_mutex.unlock();
        result
    }

    fn do_end_write(&mut self) {
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        control.write_mutex.unlock();
    }

    fn do_commit(&mut self) -> Result<u64> {
        // Unchecked fast path: holding the write mutex, the current entry
        // cannot change.
        // SAFETY: ring pointer valid; current slot mapped.
        let current_version = unsafe {
            let ring = &*self.reader_ring_ptr();
            ring.get(ring.last()).version()
        };
        let mut new_version = current_version + 1;

        // The replication hook may assign a higher version; its refusal
        // fails the transaction atomically (ring untouched, caller rolls
        // back).
        if let Some(repl) = self.replication.as_mut() {
            new_version = repl.prepare_commit(current_version)?;
        }
        debug_assert_version_advances!(current_version, new_version);

        match self.publish_commit(new_version) {
            Ok(()) => {
                if let Some(repl) = self.replication.as_mut() {
                    repl.finalize_commit();
                }
                self.repl_in_transact = false;
                Ok(new_version)
            }
            Err(err) => {
                if self.repl_in_transact {
                    if let Some(repl) = self.replication.as_mut() {
                        repl.abort_transact();
                    }
                    self.repl_in_transact = false;
                }
                Err(err)
            }
        }
    }

    /// Serialize → (sync) → publish → metadata broadcast. After the
    /// ringbuffer publication this must not fail.
    fn publish_commit(&mut self, new_version: u64) -> Result<()> {
        // The cleanup pass walks the entire ring, so the whole of it must
        // be mapped (begin_read only guarantees the current entry).
        // SAFETY: ring pointer valid.
        let entries = unsafe { (*self.reader_ring_ptr()).num_entries() };
        self.grow_reader_mapping(entries - 1)?;

        // Reclaim slots abandoned by departed readers, then bound the
        // free-space bookkeeping by the oldest version still pinned.
        // SAFETY: writer under write mutex; mapping covers all entries.
        let oldest_version = unsafe {
            let ring = &*self.reader_ring_ptr();
            ring.cleanup();
            ring.get_oldest().version()
        };
        debug_assert!(oldest_version <= new_version);
        if let Some(repl) = self.replication.as_mut() {
            repl.set_oldest_version_seen(oldest_version);
        }

        let (new_top_ref, new_file_size) =
            self.pager
                .write_snapshot(&self.workspace, new_version, oldest_version)?;

        match self.durability {
            Durability::Full => self.pager.sync_root(new_top_ref)?,
            // The on-disk file is intentionally not durably valid: MemOnly
            // never syncs, Async leaves it to the backend.
            Durability::MemOnly | Durability::Async => {}
        }

        // The snapshot we built on is superseded; its extent becomes
        // reusable once no reader can still pin it.
        self.pager
            .retire_snapshot(self.read_lock.top_ref, self.read_lock.version)?;

        // Publish to the ring, growing it first if the free marker would
        // be consumed.
        // SAFETY: writer under write mutex; remaps recompute the pointer
        // before further access.
        unsafe {
            if (*self.reader_ring_ptr()).is_full() {
                let new_entries = (*self.reader_ring_ptr()).num_entries() + GROWTH_STEP;
                let new_size = SharedControl::size_for_entries(new_entries);
                self.lock_file
                    .prealloc(new_size as u64)
                    .map_err(|e| Error::from_io(e, self.lock_file.path()))?;
                self.reader_map.remap(&self.lock_file, new_size)?;
                self.local_max_entries = new_entries;
                (*self.reader_ring_ptr()).expand_to(new_entries);
                log::debug!(
                    "[store] ring grown to {new_entries} entries for {}",
                    self.db_path.display()
                );
            }
            let ring = &*self.reader_ring_ptr();
            let slot = ring.get_next();
            slot.set_payload(new_version, new_file_size, new_top_ref);
            ring.publish_next();
        }

        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };
        {
            let _guard = control
                .control_mutex
                .lock_guard(recover_from_dead_writer)?;
            control
                .number_of_versions
                .store(new_version - oldest_version + 1, Ordering::Relaxed);
            control
                .latest_version_number
                .store(new_version, Ordering::Relaxed);
            control.new_commit_available.notify_all();
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // MAPPING MANAGEMENT
    // ---------------------------------------------------------------------

    /// Ensures the reader mapping covers slot `idx`, remapping if the ring
    /// has grown past the locally known capacity. Returns whether a remap
    /// happened (callers retry their probe).
    fn grow_reader_mapping(&mut self, idx: u32) -> Result<bool> {
        if idx >= self.local_max_entries {
            // SAFETY: the ring header lies in the always-mapped prefix.
            let entries = unsafe { (*self.reader_ring_ptr()).num_entries() };
            let new_size = SharedControl::size_for_entries(entries);
            self.reader_map.remap(&self.lock_file, new_size)?;
            self.local_max_entries = entries;
            return Ok(true);
        }
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // RAW ACCESS
    // ---------------------------------------------------------------------

    /// Control block through the fixed prefix mapping (mutexes live here;
    /// this mapping never moves).
    pub(crate) fn control_ptr(&self) -> *const SharedControl {
        self.control_map.as_ptr().cast()
    }

    /// Ringbuffer through the growable reader mapping.
    pub(crate) fn reader_ring_ptr(&self) -> *const Ringbuffer {
        // SAFETY: only the field address is computed; the header it points
        // at is within even the minimal mapping.
        unsafe { std::ptr::addr_of!((*self.reader_map.as_ptr().cast::<SharedControl>()).readers) }
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    pub(crate) fn read_lock(&self) -> ReadLock {
        self.read_lock
    }

    pub(crate) fn set_read_lock(&mut self, lock: ReadLock) {
        self.read_lock = lock;
    }

    pub(crate) fn lock_file(&self) -> &LockFile {
        &self.lock_file
    }

    pub(crate) fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub(crate) fn throttle_settings(&self) -> (i16, i16) {
        (self.max_write_slots, self.relaxed_sync_threshold)
    }
}

impl Drop for SharedStore {
    fn drop(&mut self) {
        self.do_close();
    }
}

/// Cross-thread handle that disables `wait_for_change` and wakes waiters.
///
/// The handle keeps the control mapping alive, but it must not be used
/// after the session it came from has ended (a later session re-initializes
/// the control block).
pub struct WaitForChangeRelease {
    enabled: Arc<AtomicBool>,
    control_map: Arc<Mapping>,
}

impl WaitForChangeRelease {
    /// Flips the gate and broadcasts so blocked waiters return.
    pub fn release(&self) {
        // SAFETY: the Arc keeps the control mapping alive.
        let control = unsafe { &*self.control_map.as_ptr().cast::<SharedControl>() };
        if let Ok(_guard) = control.control_mutex.lock_guard(recover_from_dead_writer) {
            self.enabled.store(false, Ordering::Relaxed);
            control.new_commit_available.notify_all();
        }
    }
}

fn lockfile_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn compaction_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".tmp_compaction_space");
    PathBuf::from(os)
}
