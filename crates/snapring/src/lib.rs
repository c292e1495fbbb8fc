//! snapring: a memory-mapped, copy-on-write, multi-version snapshot store.
//!
//! A single database file is shared by any number of processes and threads.
//! Readers pin stable historical snapshots while one writer at a time
//! commits a new one; the whole dance is coordinated through a small
//! file-backed control block (`<db>.lock`) holding robust process-shared
//! mutexes, condition variables, and a lock-free *version ringbuffer*.
//!
//! # Key pieces
//!
//! - **Version ringbuffer**: a bounded circular list of snapshot
//!   descriptors, each optimistically reference-counted by readers with a
//!   dual-stride atomic (±2 for the read count, ±1 for the free flag).
//! - **Session lifecycle**: the first attacher initializes the control
//!   block under an exclusive file lock; the last leaver may tear the
//!   session down.
//! - **Commit pipeline**: serialize the payload, optionally fsync, publish
//!   to the ring via a single release store, reclaim abandoned slots.
//! - **Async backend**: an optional peer writer that batches fsyncs while
//!   bounding the number of unflushed commits.
//!
//! # Example
//!
//! ```no_run
//! use snapring::{OpenOptions, SharedStore};
//!
//! let mut store = SharedStore::open("example.db", OpenOptions::durable())?;
//!
//! let payload = store.begin_write()?;
//! payload.extend_from_slice(b"hello");
//! let version = store.commit()?;
//!
//! let bytes = store.begin_read(None)?;
//! assert_eq!(bytes, b"hello");
//! store.end_read()?;
//! # let _ = version;
//! # Ok::<(), snapring::Error>(())
//! ```

mod config;
mod control;
mod counter;
mod daemon;
mod error;
mod invariants;
mod lockfile;
mod mapping;
mod pager;
mod replication;
mod ringbuf;
mod store;
mod sync;

pub use config::{Durability, OpenOptions, MAX_WRITE_SLOTS, RELAXED_SYNC_THRESHOLD};
pub use error::{Error, Result};
pub use replication::Replication;
pub use store::{SharedStore, VersionId, WaitForChangeRelease};
