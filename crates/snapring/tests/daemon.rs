//! Async-commit backend lifecycle: lazy start, commit draining, write-slot
//! refills, and clean exit at session end.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use snapring::{Error, OpenOptions, SharedStore};

fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("db")
}

/// Reopening with `Full` only succeeds once the backend has left the
/// session (a lingering backend still pins the Async durability level).
fn reopen_durable_when_session_ends(path: &PathBuf) -> SharedStore {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match SharedStore::open(path, OpenOptions::durable().with_no_create(true)) {
            Ok(store) => return store,
            Err(Error::InconsistentDurability { .. }) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("reopen failed: {err}"),
        }
    }
}

#[test]
fn async_commits_publish_and_drain_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let mut store = SharedStore::open(&path, OpenOptions::async_commits()).unwrap();

    let mut expected = store.current_version().unwrap();
    for i in 0..25u8 {
        let payload = store.begin_write().unwrap();
        payload.clear();
        payload.extend_from_slice(&[i; 64]);
        expected = store.commit().unwrap();
    }
    assert_eq!(store.current_version().unwrap(), expected);
    store.close();

    // Before exiting, the backend syncs the newest published snapshot, so
    // a fresh durable session finds it on disk.
    let mut store = reopen_durable_when_session_ends(&path);
    assert_eq!(store.current_version().unwrap(), expected);
    assert_eq!(store.begin_read(None).unwrap(), &[24u8; 64][..]);
    store.end_read().unwrap();
}

#[test]
fn writers_survive_a_small_slot_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    // A tiny budget forces the throttle path: writers repeatedly run out of
    // slots and must wait for the backend to refill them.
    let opts = OpenOptions::async_commits().with_write_slots(4, 2);
    let mut store = SharedStore::open(&path, opts).unwrap();

    let mut last = 0;
    for i in 0..40u8 {
        let payload = store.begin_write().unwrap();
        payload.clear();
        payload.push(i);
        last = store.commit().unwrap();
    }
    assert_eq!(store.current_version().unwrap(), last);

    store.close();
    let mut store = reopen_durable_when_session_ends(&path);
    assert_eq!(store.begin_read(None).unwrap(), &[39u8][..]);
    store.end_read().unwrap();
}

#[test]
fn second_async_attachment_reuses_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);

    let mut first = SharedStore::open(&path, OpenOptions::async_commits()).unwrap();
    let mut second = SharedStore::open(&path, OpenOptions::async_commits()).unwrap();

    first.begin_write().unwrap().push(1);
    let v1 = first.commit().unwrap();
    second.begin_write().unwrap().push(2);
    let v2 = second.commit().unwrap();
    assert_eq!(v2, v1 + 1);

    assert_eq!(first.current_version().unwrap(), v2);

    first.close();
    second.close();

    let mut store = reopen_durable_when_session_ends(&path);
    assert_eq!(store.current_version().unwrap(), v2);
}
