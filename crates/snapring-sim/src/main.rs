//! Stress harness: hammer one store file with concurrent reader and writer
//! attachments and verify snapshot isolation as we go.
//!
//! ```text
//! snapring-sim [DB_PATH] [COMMITS] [READERS] [SEED]
//! ```
//!
//! Defaults: a MemOnly store under the system temp dir, 2,000 commits,
//! 4 readers, seed 42. Every committed payload is self-describing
//! (version stamped into the bytes), so each reader can verify that the
//! payload it pinned matches the version it pinned, every time it looks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use snapring::{OpenOptions, SharedStore};

/// Payload written for a version: the version stamped over 64 bytes.
fn payload_for(version: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    for i in 0..8u64 {
        bytes.extend_from_slice(&(version ^ i).to_le_bytes());
    }
    bytes
}

fn verify_payload(version: u64, bytes: &[u8]) {
    if bytes.is_empty() {
        // Only the pre-first-commit snapshot carries no payload.
        assert_eq!(version, 1, "empty payload at version {version}");
        return;
    }
    assert_eq!(
        bytes,
        payload_for(version).as_slice(),
        "snapshot payload does not match its version {version}"
    );
}

struct Config {
    db_path: PathBuf,
    commits: u64,
    readers: usize,
    seed: u64,
}

fn parse_args() -> Config {
    let mut args = std::env::args().skip(1);
    let db_path = args
        .next()
        .map_or_else(|| std::env::temp_dir().join("snapring-sim.db"), PathBuf::from);
    let commits = args.next().and_then(|a| a.parse().ok()).unwrap_or(2_000);
    let readers = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let seed = args.next().and_then(|a| a.parse().ok()).unwrap_or(42);
    Config {
        db_path,
        commits,
        readers,
        seed,
    }
}

fn main() {
    env_logger::init();
    let config = parse_args();

    // Leftovers from an aborted run would fail the version checks.
    let _ = std::fs::remove_file(&config.db_path);

    log::info!(
        "simulating {} commits against {} with {} readers (seed {})",
        config.commits,
        config.db_path.display(),
        config.readers,
        config.seed
    );

    let stop = Arc::new(AtomicBool::new(false));
    let pins_taken = Arc::new(AtomicU64::new(0));

    let mut readers = Vec::new();
    for reader_id in 0..config.readers {
        let db_path = config.db_path.clone();
        let stop = Arc::clone(&stop);
        let pins_taken = Arc::clone(&pins_taken);
        let seed = config.seed ^ (reader_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        readers.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut store =
                SharedStore::open(&db_path, OpenOptions::mem_only()).expect("reader open");
            let mut checks = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let bytes = store.begin_read(None).expect("begin_read").to_vec();
                let id = store
                    .version_of_current_transaction()
                    .expect("pinned version");
                verify_payload(id.version, &bytes);
                pins_taken.fetch_add(1, Ordering::Relaxed);

                // Dwell on the snapshot while the writer races ahead, then
                // confirm it did not move.
                if rng.gen_bool(0.3) {
                    thread::sleep(Duration::from_micros(rng.gen_range(10..500)));
                }
                assert_eq!(store.data().expect("pinned data"), bytes.as_slice());
                verify_payload(id.version, store.data().expect("pinned data"));
                store.end_read().expect("end_read");
                checks += 1;
            }
            checks
        }));
    }

    let start = Instant::now();
    let mut writer =
        SharedStore::open(&config.db_path, OpenOptions::mem_only()).expect("writer open");
    let mut last_version = writer.current_version().expect("current_version");
    for _ in 0..config.commits {
        let next_version = last_version + 1;
        let bytes = payload_for(next_version);
        let payload = writer.begin_write().expect("begin_write");
        payload.clear();
        payload.extend_from_slice(&bytes);
        let committed = writer.commit().expect("commit");
        assert_eq!(committed, next_version, "writer is the only committer");
        last_version = committed;
    }
    let elapsed = start.elapsed();

    stop.store(true, Ordering::Relaxed);
    let mut total_reads = 0u64;
    for handle in readers {
        total_reads += handle.join().expect("reader panicked");
    }

    let live = writer.number_of_versions().expect("number_of_versions");
    log::info!(
        "done: {} commits in {:.2?} ({:.0} commits/s), {} verified reads, {} pins, {} live versions",
        config.commits,
        elapsed,
        config.commits as f64 / elapsed.as_secs_f64(),
        total_reads,
        pins_taken.load(Ordering::Relaxed),
        live
    );

    writer.close();
    println!("ok: {} commits, {total_reads} verified reads", config.commits);
}
