//! Open-time configuration for a shared store.

/// Commit-to-disk policy, fixed when the session is created.
///
/// Every later attachment must request the same level; a mismatch fails the
/// open with [`crate::Error::InconsistentDurability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Every commit is flushed to stable storage before it is published.
    Full,
    /// The file is only backing memory; it is deleted when the last
    /// attachment closes. The on-disk bytes are never guaranteed valid.
    MemOnly,
    /// Commits publish in memory; a backend peer batches the flushes.
    Async,
}

impl Durability {
    /// Wire encoding stored in the shared control block.
    #[inline]
    pub(crate) fn to_wire(self) -> u16 {
        match self {
            Durability::Full => 0,
            Durability::MemOnly => 1,
            Durability::Async => 2,
        }
    }

    #[inline]
    pub(crate) fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Durability::Full),
            1 => Some(Durability::MemOnly),
            2 => Some(Durability::Async),
            _ => None,
        }
    }
}

/// Default bound on commits the async backend may leave unflushed.
pub const MAX_WRITE_SLOTS: i16 = 100;

/// When fewer than this many slots remain, writers kick the backend awake.
pub const RELAXED_SYNC_THRESHOLD: i16 = 50;

/// Options controlling how [`crate::SharedStore::open`] attaches to a store.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Fail instead of creating a missing data file.
    pub no_create: bool,
    /// Commit-to-disk policy for the session.
    pub durability: Durability,
    /// Encryption key handed to the file layer. Pinning a key restricts the
    /// session to the initiating process.
    pub encryption_key: Option<Vec<u8>>,
    /// Permit rewriting an older (but upgradable) data-file format tag.
    pub allow_file_format_upgrade: bool,
    /// Attach as the async-commit backend. Library users never set this;
    /// the backend thread does.
    pub(crate) is_backend: bool,
    /// Bound on unflushed commits in `Async` mode.
    pub max_write_slots: i16,
    /// Slack threshold below which writers nudge the backend.
    pub relaxed_sync_threshold: i16,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            no_create: false,
            durability: Durability::Full,
            encryption_key: None,
            allow_file_format_upgrade: true,
            is_backend: false,
            max_write_slots: MAX_WRITE_SLOTS,
            relaxed_sync_threshold: RELAXED_SYNC_THRESHOLD,
        }
    }
}

impl OpenOptions {
    /// Options for a fully durable store (the default).
    pub fn durable() -> Self {
        Self::default()
    }

    /// Options for a transient store deleted when the session ends.
    pub fn mem_only() -> Self {
        Self::default().with_durability(Durability::MemOnly)
    }

    /// Options for async-commit mode with default throttle settings.
    pub fn async_commits() -> Self {
        Self::default().with_durability(Durability::Async)
    }

    /// Sets the durability level.
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Fails the open if the data file does not already exist.
    pub fn with_no_create(mut self, no_create: bool) -> Self {
        self.no_create = no_create;
        self
    }

    /// Supplies an encryption key for the file layer.
    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    /// Controls whether an older data-file format may be upgraded in place.
    pub fn with_file_format_upgrade(mut self, allow: bool) -> Self {
        self.allow_file_format_upgrade = allow;
        self
    }

    /// Tunes the async-mode write throttle.
    pub fn with_write_slots(mut self, max: i16, relaxed_threshold: i16) -> Self {
        assert!(max > 0, "max_write_slots must be positive");
        assert!(
            relaxed_threshold > 0 && relaxed_threshold <= max,
            "relaxed_sync_threshold must be in 1..=max_write_slots"
        );
        self.max_write_slots = max;
        self.relaxed_sync_threshold = relaxed_threshold;
        self
    }

    pub(crate) fn backend(mut self) -> Self {
        self.is_backend = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_wire_round_trip() {
        for d in [Durability::Full, Durability::MemOnly, Durability::Async] {
            assert_eq!(Durability::from_wire(d.to_wire()), Some(d));
        }
        assert_eq!(Durability::from_wire(7), None);
    }

    #[test]
    fn builder_presets() {
        let opts = OpenOptions::mem_only();
        assert_eq!(opts.durability, Durability::MemOnly);
        assert!(!opts.is_backend);

        let opts = OpenOptions::async_commits().with_write_slots(10, 5);
        assert_eq!(opts.max_write_slots, 10);
        assert_eq!(opts.relaxed_sync_threshold, 5);
    }

    #[test]
    #[should_panic(expected = "relaxed_sync_threshold")]
    fn builder_rejects_bad_threshold() {
        let _ = OpenOptions::async_commits().with_write_slots(10, 11);
    }
}
