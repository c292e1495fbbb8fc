//! Hook for an external replication log.
//!
//! The coordinator drives the hook at fixed points of the transaction
//! lifecycle; the log itself (storage, transport, trimming) lives outside
//! this crate.

use crate::error::Result;

/// Callbacks a replication log receives from the commit pipeline.
///
/// Ordering guarantees: `prepare_commit` runs before anything is written to
/// the data file; if it errors the transaction fails atomically and the ring
/// is untouched. `finalize_commit` runs after publication and must not fail.
pub trait Replication: Send {
    /// Session start: the log may discard entries past `version`.
    fn reset_log_management(&mut self, version: u64);

    /// A write transaction began on top of `current_version`.
    fn initiate_transact(&mut self, current_version: u64) -> Result<()>;

    /// About to commit on top of `current_version`; returns the version the
    /// new snapshot must carry (≥ `current_version + 1`).
    fn prepare_commit(&mut self, current_version: u64) -> Result<u64>;

    /// The snapshot was published. Infallible by contract.
    fn finalize_commit(&mut self);

    /// The transaction rolled back (including a failed `prepare_commit`).
    fn abort_transact(&mut self);

    /// No live reader is older than `version`; earlier log entries may be
    /// reclaimed.
    fn set_oldest_version_seen(&mut self, version: u64);

    /// Session end: stop managing the log.
    fn stop_logging(&mut self);
}
