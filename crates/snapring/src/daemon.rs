//! The async-commit backend: a peer attachment that drains memory-only
//! commits to disk.
//!
//! In `Async` durability, writers publish snapshots without syncing; the
//! backend periodically writes the newest published top-ref durably and
//! refills the writers' slot budget (`free_write_slots`), bounding how many
//! unflushed commits can be in flight. It is deliberately *not* an embedded
//! task of any one attachment: it takes the same write mutex and pins
//! snapshots through the same ringbuffer protocol as every other
//! participant, which keeps the invariant set unchanged.
//!
//! The backend runs as a dedicated thread holding its own attachment. It
//! exits when the lock file disappears (an operator removed it) or when it
//! is the last participant left.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::OpenOptions;
use crate::error::Result;
use crate::store::{recover_from_dead_writer, SharedStore};

/// How long the backend naps when writers still have plenty of slack.
const RELAXED_SLEEP: Duration = Duration::from_millis(10);

/// Launches the backend thread. Called by the first non-backend opener of
/// an async session, with `daemon_started` already flipped under the
/// control mutex.
pub(crate) fn spawn(db_path: PathBuf, opts: OpenOptions) {
    let spawned = std::thread::Builder::new()
        .name("snapring-backend".into())
        .spawn(move || match SharedStore::open(&db_path, opts) {
            Ok(mut store) => {
                if let Err(err) = store.run_async_commits() {
                    log::error!("[daemon] backend loop failed for {}: {err}", db_path.display());
                }
            }
            Err(err) => {
                log::error!("[daemon] backend open failed for {}: {err}", db_path.display());
            }
        });
    if let Err(err) = spawned {
        log::error!("[daemon] could not spawn backend thread: {err}");
    }
}

impl SharedStore {
    /// The backend loop. Runs on the backend's own attachment until the
    /// session winds down. On an error exit the lifecycle flags are cleared
    /// so a later opener can start a replacement.
    pub(crate) fn run_async_commits(&mut self) -> Result<()> {
        let result = self.async_commit_loop();
        if result.is_err() {
            // SAFETY: control mapping live while attached.
            let control = unsafe { &*self.control_ptr() };
            control.daemon_started.store(0, Ordering::Release);
            control.daemon_ready.store(0, Ordering::Release);
        }
        result
    }

    fn async_commit_loop(&mut self) -> Result<()> {
        let (max_write_slots, relaxed_sync_threshold) = self.throttle_settings();
        // SAFETY: control mapping live while attached.
        let control = unsafe { &*self.control_ptr() };

        // Keep a reference on the last version written to disk, protecting
        // it from being overwritten by in-memory commits.
        let (pinned, _) = self.grab_latest_snapshot()?;
        self.set_read_lock(pinned);

        {
            let _guard = control
                .control_mutex
                .lock_guard(recover_from_dead_writer)?;
            control
                .free_write_slots
                .store(max_write_slots, Ordering::Relaxed);
            control.daemon_ready.store(1, Ordering::Release);
            control.daemon_becomes_ready.notify_all();
        }
        log::info!("[daemon] backend ready");

        let mut shutdown = false;
        loop {
            if self.lock_file().is_removed() {
                // Operator removed the lock file: take the hint.
                log::info!("[daemon] lock file removed, shutting down");
                shutdown = true;
            }

            let (next, same) = {
                // Deciding whether we are the last participant must happen
                // with both mutexes held, or a closing writer could race us.
                let _write_guard = control.write_mutex.lock_guard(recover_from_dead_writer)?;
                let _guard = control
                    .control_mutex
                    .lock_guard(recover_from_dead_writer)?;
                let (next, same) = self.grab_latest_snapshot()?;
                if same && (shutdown || control.num_participants.load(Ordering::Relaxed) == 1) {
                    self.release_lock(&next);
                    let pinned = self.read_lock();
                    self.release_lock(&pinned);
                    control.daemon_started.store(0, Ordering::Release);
                    control.daemon_ready.store(0, Ordering::Release);
                    log::info!("[daemon] backend exiting");
                    return Ok(());
                }
                (next, same)
            };

            if !same {
                log::debug!(
                    "[daemon] syncing version {} -> {}",
                    self.read_lock().version,
                    next.version
                );
                self.pager_mut().sync_root(next.top_ref)?;
            }

            // The previously pinned version is durably superseded; keep the
            // reference on the newly synced one instead.
            let old = self.read_lock();
            self.release_lock(&old);
            self.set_read_lock(next);

            control.balance_mutex.lock(recover_from_dead_writer)?;
            let free = control.free_write_slots.load(Ordering::Relaxed);
            control
                .free_write_slots
                .store(max_write_slots, Ordering::Relaxed);
            if free <= 0 {
                // Writers were starved; let them run.
                control.room_to_write.notify_all();
            }
            let nap = if free > relaxed_sync_threshold {
                // Plenty of slack: relax until a writer kicks us or the nap
                // elapses.
                Some(RELAXED_SLEEP)
            } else {
                None
            };
            if let Some(timeout) = nap {
                let _ = control.work_to_do.wait(
                    &control.balance_mutex,
                    recover_from_dead_writer,
                    Some(timeout),
                );
            }
            control.balance_mutex.unlock();
        }
    }
}
