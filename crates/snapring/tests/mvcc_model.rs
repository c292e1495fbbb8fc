//! Property-based model test: random interleavings of commits and snapshot
//! pins against a reference model.
//!
//! Invariants exercised:
//! - committed versions are strictly monotonic within a session;
//! - a pinned reader observes exactly the payload that was current when it
//!   pinned, no matter how many commits land afterwards;
//! - the latest snapshot always equals the last committed payload;
//! - ending the pin and committing again lets reclamation shrink the live
//!   window back down.

use proptest::prelude::*;

use snapring::{OpenOptions, SharedStore};

#[derive(Debug, Clone)]
enum Op {
    /// Commit a payload derived from this byte.
    Commit(u8),
    /// Pin the latest snapshot in the reader attachment.
    Pin,
    /// Drop the reader's pin.
    Unpin,
    /// Verify the pinned payload is untouched.
    CheckPinned,
    /// Verify a fresh read sees the last committed payload.
    CheckLatest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<u8>().prop_map(Op::Commit),
        2 => Just(Op::Pin),
        2 => Just(Op::Unpin),
        2 => Just(Op::CheckPinned),
        2 => Just(Op::CheckLatest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_interleavings_preserve_snapshot_isolation(
        ops in proptest::collection::vec(op_strategy(), 1..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        // MemOnly keeps the runs fast (no fsync per commit) without
        // changing any of the snapshot semantics under test.
        let mut writer = SharedStore::open(&path, OpenOptions::mem_only()).unwrap();
        let mut reader = SharedStore::open(&path, OpenOptions::mem_only()).unwrap();

        // Reference model.
        let mut latest_payload: Vec<u8> = Vec::new();
        let mut latest_version = writer.current_version().unwrap();
        let mut pinned: Option<(u64, Vec<u8>)> = None;

        for op in ops {
            match op {
                Op::Commit(byte) => {
                    let payload = writer.begin_write().unwrap();
                    payload.clear();
                    payload.extend_from_slice(&[byte; 16]);
                    let version = writer.commit().unwrap();
                    prop_assert!(version > latest_version,
                        "version regressed: {} after {}", version, latest_version);
                    latest_version = version;
                    latest_payload = vec![byte; 16];
                }
                Op::Pin => {
                    if pinned.is_none() {
                        let bytes = reader.begin_read(None).unwrap().to_vec();
                        let id = reader.version_of_current_transaction().unwrap();
                        prop_assert_eq!(&bytes, &latest_payload);
                        prop_assert_eq!(id.version, latest_version);
                        pinned = Some((id.version, bytes));
                    }
                }
                Op::Unpin => {
                    if pinned.take().is_some() {
                        reader.end_read().unwrap();
                    }
                }
                Op::CheckPinned => {
                    if let Some((version, bytes)) = &pinned {
                        prop_assert_eq!(reader.data().unwrap(), bytes.as_slice());
                        prop_assert_eq!(
                            reader.version_of_current_transaction().unwrap().version,
                            *version
                        );
                    }
                }
                Op::CheckLatest => {
                    // A second observation through the writer attachment
                    // (independent of the reader's pin).
                    let bytes = writer.begin_read(None).unwrap().to_vec();
                    prop_assert_eq!(&bytes, &latest_payload);
                    writer.end_read().unwrap();
                    prop_assert_eq!(writer.current_version().unwrap(), latest_version);
                }
            }

            let live = writer.number_of_versions().unwrap();
            prop_assert!(live >= 1);
            if let Some((pin_version, _)) = &pinned {
                // Every version from the pin to the latest must still be
                // live.
                prop_assert!(live >= latest_version - pin_version + 1);
            }
        }

        // Cleanup converges once nothing is pinned.
        if pinned.take().is_some() {
            reader.end_read().unwrap();
        }
        writer.begin_write().unwrap().push(0);
        writer.commit().unwrap();
        prop_assert!(writer.number_of_versions().unwrap() <= 2);
    }
}
