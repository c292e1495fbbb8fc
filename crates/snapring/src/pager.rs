//! The data-file collaborator: attaches the store file, serializes snapshot
//! payloads into it, and hands back `{top_ref, file_size}` pairs for the
//! ringbuffer to publish.
//!
//! The on-disk format is owned entirely by this module and opaque to the
//! coordinator:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | Header (40 bytes): magic, format tag, flags, key fingerprint,|
//! |                    durable top_ref, crc                      |
//! +--------------------------------------------------------------+
//! | Snapshot chunks, each: len u32 | crc32 u32 | version u64 |   |
//! |                        payload bytes                         |
//! +--------------------------------------------------------------+
//! ```
//!
//! A `top_ref` is the file offset of a chunk. Commits append (or recycle a
//! retired extent, see below); only a durable root update rewrites the
//! header. Free-space bookkeeping never recycles an extent until the oldest
//! live snapshot has moved past the version whose payload it held, so a
//! reader holding an old snapshot always finds its bytes intact.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const MAGIC: u64 = 0x534E_4150_5249_4E47; // "SNAPRING"

/// Format tag this build writes.
pub const FORMAT_TAG: u16 = 2;
/// Oldest format tag that can be upgraded in place.
const UPGRADABLE_TAG: u16 = 1;

const FLAG_ENCRYPTED: u16 = 1;

const HEADER_LEN: u64 = 40;
const CHUNK_HEADER_LEN: u64 = 16;

/// Result of attaching the data file.
#[derive(Debug, Clone, Copy)]
pub struct AttachInfo {
    /// Offset of the most recent durable snapshot chunk (0 = empty file).
    pub top_ref: u64,
    /// Logical extent of the file.
    pub file_size: u64,
    /// Version extracted from the durable root (1 if absent).
    pub version: u64,
}

/// Attach-time configuration, set by the session open protocol.
#[derive(Debug, Default)]
pub struct AttachConfig<'a> {
    /// First attachment of the session: may create/validate/upgrade.
    pub session_initiator: bool,
    /// Fail instead of creating a missing file.
    pub no_create: bool,
    /// Truncate leftover content (stale MemOnly file from a crashed
    /// session).
    pub clear_file: bool,
    /// Permit rewriting an upgradable format tag.
    pub allow_file_format_upgrade: bool,
    /// Key for the file layer; pins the header fingerprint.
    pub encryption_key: Option<&'a [u8]>,
}

/// A retired chunk extent eligible for reuse once readers move on.
#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: u64,
    /// Version whose payload this extent held; reusable once the oldest
    /// live snapshot is strictly newer.
    version: u64,
}

/// Owner of the data file.
pub struct Pager {
    file: Option<File>,
    path: PathBuf,
    key_fingerprint: u64,
    encrypted: bool,
    /// Logical end of valid data (the `file_size` published with
    /// snapshots).
    logical_size: u64,
    /// Per-attachment freelist. A writer in another process won't see these
    /// extents and appends instead; that wastes space but never corrupts.
    freelist: Vec<Extent>,
}

impl Pager {
    pub fn new(path: &Path) -> Self {
        Self {
            file: None,
            path: path.to_path_buf(),
            key_fingerprint: 0,
            encrypted: false,
            logical_size: 0,
            freelist: Vec::new(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens (creating if allowed) and validates the data file.
    pub fn attach(&mut self, cfg: &AttachConfig<'_>) -> Result<AttachInfo> {
        debug_assert!(!self.is_attached());

        let fingerprint = cfg.encryption_key.map(key_fingerprint);

        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if cfg.no_create || !cfg.session_initiator {
                    return Err(Error::FileNotFound {
                        path: self.path.display().to_string(),
                    });
                }
                self.create_fresh()?
            }
            Err(err) => return Err(Error::from_io(err, &self.path)),
        };

        if cfg.clear_file && cfg.session_initiator {
            file.set_len(0).map_err(|e| Error::from_io(e, &self.path))?;
        }

        let len = file
            .metadata()
            .map_err(|e| Error::from_io(e, &self.path))?
            .len();

        let info = if len == 0 {
            // Freshly created or cleared: lay down an empty header.
            self.key_fingerprint = fingerprint.unwrap_or(0);
            self.encrypted = fingerprint.is_some();
            write_header(&file, FORMAT_TAG, self.header_flags(), self.key_fingerprint, 0)
                .map_err(|e| Error::from_io(e, &self.path))?;
            AttachInfo {
                top_ref: 0,
                file_size: HEADER_LEN,
                version: 1,
            }
        } else {
            self.validate_existing(&file, cfg, fingerprint, len)?
        };

        self.logical_size = info.file_size;
        self.file = Some(file);
        Ok(info)
    }

    fn create_fresh(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::from_io(e, &self.path))
    }

    fn validate_existing(
        &mut self,
        file: &File,
        cfg: &AttachConfig<'_>,
        fingerprint: Option<u64>,
        len: u64,
    ) -> Result<AttachInfo> {
        if len < HEADER_LEN {
            return Err(Error::Corrupt(format!(
                "file is {len} bytes, smaller than the header"
            )));
        }

        let header = read_header(file).map_err(|e| Error::from_io(e, &self.path))?;
        if header.magic != MAGIC {
            return Err(Error::Corrupt("bad magic number".into()));
        }
        if !header.crc_ok {
            return Err(Error::Corrupt("header checksum mismatch".into()));
        }

        match header.format_tag {
            FORMAT_TAG => {}
            UPGRADABLE_TAG => {
                if !cfg.allow_file_format_upgrade || !cfg.session_initiator {
                    return Err(Error::UnsupportedFileFormat {
                        found: header.format_tag,
                        supported: FORMAT_TAG,
                    });
                }
                log::info!(
                    "[pager] upgrading {} from format tag {} to {}",
                    self.path.display(),
                    header.format_tag,
                    FORMAT_TAG
                );
                write_header(
                    file,
                    FORMAT_TAG,
                    header.flags,
                    header.key_fingerprint,
                    header.top_ref,
                )
                .map_err(|e| Error::from_io(e, &self.path))?;
            }
            other => {
                return Err(Error::UnsupportedFileFormat {
                    found: other,
                    supported: FORMAT_TAG,
                });
            }
        }

        let file_encrypted = header.flags & FLAG_ENCRYPTED != 0;
        match (file_encrypted, fingerprint) {
            (false, None) => {}
            (true, Some(fp)) if fp == header.key_fingerprint => {}
            _ => {
                return Err(Error::Corrupt(
                    "encryption key missing or does not match this file".into(),
                ));
            }
        }
        self.encrypted = file_encrypted;
        self.key_fingerprint = header.key_fingerprint;

        let (version, chunk_end) = if header.top_ref == 0 {
            (1, HEADER_LEN)
        } else {
            let chunk = self.read_chunk_header(file, header.top_ref)?;
            // Version 0 predates versioned roots; it is not a legal initial
            // version.
            let version = if chunk.version == 0 { 1 } else { chunk.version };
            (version, header.top_ref + CHUNK_HEADER_LEN + u64::from(chunk.len))
        };

        Ok(AttachInfo {
            top_ref: header.top_ref,
            file_size: len.max(chunk_end),
            version,
        })
    }

    fn header_flags(&self) -> u16 {
        if self.encrypted {
            FLAG_ENCRYPTED
        } else {
            0
        }
    }

    /// Releases the file handle; the freelist dies with the attachment.
    pub fn detach(&mut self) {
        self.file = None;
        self.freelist.clear();
        self.logical_size = 0;
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closed)
    }

    /// Logical extent of the file as of the last write.
    pub fn baseline(&self) -> u64 {
        self.logical_size
    }

    /// Loads and verifies the payload a snapshot's top-ref points to.
    pub fn read_payload(&self, top_ref: u64) -> Result<Vec<u8>> {
        if top_ref == 0 {
            return Ok(Vec::new());
        }
        let file = self.file()?;
        let chunk = self.read_chunk_header(file, top_ref)?;
        let mut payload = vec![0u8; chunk.len as usize];
        file.read_exact_at(&mut payload, top_ref + CHUNK_HEADER_LEN)
            .map_err(|e| Error::from_io(e, &self.path))?;
        if crc32fast::hash(&payload) != chunk.crc {
            return Err(Error::Corrupt(format!(
                "payload checksum mismatch at offset {top_ref}"
            )));
        }
        Ok(payload)
    }

    fn read_chunk_header(&self, file: &File, offset: u64) -> Result<ChunkHeader> {
        let mut buf = [0u8; CHUNK_HEADER_LEN as usize];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| Error::from_io(e, &self.path))?;
        Ok(ChunkHeader {
            len: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            version: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }

    /// Serializes a new snapshot and returns `(top_ref, file_size)`.
    ///
    /// `oldest_live_version` bounds extent recycling: only space retired by
    /// snapshots strictly older may be overwritten, so concurrent readers
    /// of any live snapshot keep their bytes.
    pub fn write_snapshot(
        &mut self,
        payload: &[u8],
        version: u64,
        oldest_live_version: u64,
    ) -> Result<(u64, u64)> {
        let need = CHUNK_HEADER_LEN
            .checked_add(payload.len() as u64)
            .ok_or(Error::Range)?;

        // Best-fit over reclaimable extents; fall back to appending.
        let offset = match self.pick_extent(need, oldest_live_version) {
            Some(extent) => extent.offset,
            None => self.logical_size,
        };
        let end = offset.checked_add(need).ok_or(Error::Range)?;

        let file = self.file.as_ref().ok_or(Error::Closed)?;
        let mut chunk = Vec::with_capacity(need as usize);
        chunk.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        chunk.extend_from_slice(&version.to_le_bytes());
        chunk.extend_from_slice(payload);
        file.write_all_at(&chunk, offset)
            .map_err(|e| Error::from_io(e, &self.path))?;

        self.logical_size = self.logical_size.max(end);
        Ok((offset, self.logical_size))
    }

    fn pick_extent(&mut self, need: u64, oldest_live_version: u64) -> Option<Extent> {
        let mut best: Option<usize> = None;
        for (i, extent) in self.freelist.iter().enumerate() {
            if extent.version >= oldest_live_version || extent.len < need {
                continue;
            }
            match best {
                Some(b) if self.freelist[b].len <= extent.len => {}
                _ => best = Some(i),
            }
        }
        best.map(|i| self.freelist.swap_remove(i))
    }

    /// Records that the chunk at `top_ref` (holding `version`'s payload) has
    /// been superseded and may be recycled once readers move past it.
    pub fn retire_snapshot(&mut self, top_ref: u64, version: u64) -> Result<()> {
        if top_ref == 0 {
            return Ok(());
        }
        let file = self.file()?;
        let chunk = self.read_chunk_header(file, top_ref)?;
        self.freelist.push(Extent {
            offset: top_ref,
            len: CHUNK_HEADER_LEN + u64::from(chunk.len),
            version,
        });
        Ok(())
    }

    /// Durably records `top_ref` as the file's root: data sync, header
    /// rewrite, header sync.
    pub fn sync_root(&mut self, top_ref: u64) -> Result<()> {
        let file = self.file()?;
        file.sync_data().map_err(|e| Error::from_io(e, &self.path))?;
        write_header(
            file,
            FORMAT_TAG,
            self.header_flags(),
            self.key_fingerprint,
            top_ref,
        )
        .map_err(|e| Error::from_io(e, &self.path))?;
        file.sync_data().map_err(|e| Error::from_io(e, &self.path))
    }

    /// Grows the file allocation ahead of bulk writes.
    pub fn reserve(&self, size: u64) -> Result<()> {
        let file = self.file()?;
        let len = i64::try_from(size).map_err(|_| Error::Range)?;
        // SAFETY: posix_fallocate on a valid owned descriptor.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
        match rc {
            0 => Ok(()),
            libc::ENOSPC => Err(Error::OutOfDiskSpace),
            err => Err(Error::Io(io::Error::from_raw_os_error(err))),
        }
    }

    /// Writes a fresh single-snapshot file at `tmp_path` and atomically
    /// renames it over the data file. The caller must detach first and
    /// re-attach afterwards.
    pub fn write_compacted(&self, tmp_path: &Path, payload: &[u8], version: u64) -> Result<u64> {
        debug_assert!(!self.is_attached());
        let _ = std::fs::remove_file(tmp_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(tmp_path)
            .map_err(|e| Error::from_io(e, tmp_path))?;

        let top_ref = HEADER_LEN;
        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN as usize + payload.len());
        chunk.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        chunk.extend_from_slice(&version.to_le_bytes());
        chunk.extend_from_slice(payload);
        file.write_all_at(&chunk, top_ref)
            .map_err(|e| Error::from_io(e, tmp_path))?;
        write_header(&file, FORMAT_TAG, self.header_flags(), self.key_fingerprint, top_ref)
            .map_err(|e| Error::from_io(e, tmp_path))?;
        file.sync_all().map_err(|e| Error::from_io(e, tmp_path))?;

        std::fs::rename(tmp_path, &self.path).map_err(|e| Error::from_io(e, &self.path))?;
        Ok(top_ref)
    }

    /// Deletes the data file (MemOnly session end). Best-effort.
    pub fn remove_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!(
                    "[pager] could not remove {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

struct ChunkHeader {
    len: u32,
    crc: u32,
    version: u64,
}

struct Header {
    magic: u64,
    format_tag: u16,
    flags: u16,
    key_fingerprint: u64,
    top_ref: u64,
    crc_ok: bool,
}

fn read_header(file: &File) -> io::Result<Header> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.read_exact_at(&mut buf, 0)?;
    let stored_crc = u32::from_le_bytes(buf[32..36].try_into().unwrap());
    Ok(Header {
        magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        format_tag: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
        flags: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
        key_fingerprint: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        top_ref: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        crc_ok: stored_crc == crc32fast::hash(&buf[..32]),
    })
}

fn write_header(
    file: &File,
    format_tag: u16,
    flags: u16,
    key_fingerprint: u64,
    top_ref: u64,
) -> io::Result<()> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
    buf[8..10].copy_from_slice(&format_tag.to_le_bytes());
    buf[10..12].copy_from_slice(&flags.to_le_bytes());
    // bytes 12..16 reserved
    buf[16..24].copy_from_slice(&key_fingerprint.to_le_bytes());
    buf[24..32].copy_from_slice(&top_ref.to_le_bytes());
    let crc = crc32fast::hash(&buf[..32]);
    buf[32..36].copy_from_slice(&crc.to_le_bytes());
    file.write_all_at(&buf, 0)
}

/// Key fingerprint pinned in the header: enough to reject a wrong key,
/// not a substitute for real content encryption (which belongs to the
/// underlying file layer).
fn key_fingerprint(key: &[u8]) -> u64 {
    let forward = crc32fast::hash(key);
    let mut rev = key.to_vec();
    rev.reverse();
    let backward = crc32fast::hash(&rev);
    (u64::from(forward) << 32) | u64::from(backward)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach_fresh(dir: &tempfile::TempDir) -> (Pager, AttachInfo) {
        let path = dir.path().join("db");
        let mut pager = Pager::new(&path);
        let info = pager
            .attach(&AttachConfig {
                session_initiator: true,
                allow_file_format_upgrade: true,
                ..AttachConfig::default()
            })
            .unwrap();
        (pager, info)
    }

    #[test]
    fn fresh_file_has_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let (pager, info) = attach_fresh(&dir);
        assert_eq!(info.top_ref, 0);
        assert_eq!(info.version, 1);
        assert_eq!(pager.baseline(), HEADER_LEN);
    }

    #[test]
    fn no_create_refuses_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::new(&dir.path().join("absent"));
        let err = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                ..AttachConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }

    #[test]
    fn snapshot_round_trip_through_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pager, _) = attach_fresh(&dir);

        let (top_ref, file_size) = pager.write_snapshot(b"hello snapshots", 2, 1).unwrap();
        assert!(top_ref >= HEADER_LEN);
        assert!(file_size > top_ref);
        pager.sync_root(top_ref).unwrap();
        pager.detach();

        let info = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                allow_file_format_upgrade: true,
                ..AttachConfig::default()
            })
            .unwrap();
        assert_eq!(info.top_ref, top_ref);
        assert_eq!(info.version, 2);
        assert_eq!(pager.read_payload(top_ref).unwrap(), b"hello snapshots");
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pager, _) = attach_fresh(&dir);

        let (top_ref, _) = pager.write_snapshot(b"precious", 2, 1).unwrap();

        // Flip a payload byte behind the pager's back.
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("db"))
            .unwrap();
        file.write_all_at(b"X", top_ref + CHUNK_HEADER_LEN).unwrap();

        assert!(matches!(
            pager.read_payload(top_ref),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn extent_reuse_waits_for_readers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pager, _) = attach_fresh(&dir);

        let (top2, _) = pager.write_snapshot(&[0u8; 100], 2, 1).unwrap();
        let (_top3, _) = pager.write_snapshot(&[1u8; 100], 3, 1).unwrap();
        pager.retire_snapshot(top2, 2).unwrap();

        // Oldest live version is still 2: the retired extent must not be
        // recycled.
        let (top4, _) = pager.write_snapshot(&[2u8; 50], 4, 2).unwrap();
        assert_ne!(top4, top2);

        // Once readers have moved past version 2 the extent is fair game.
        let (top5, _) = pager.write_snapshot(&[3u8; 50], 5, 3).unwrap();
        assert_eq!(top5, top2);
        assert_eq!(pager.read_payload(top5).unwrap(), vec![3u8; 50]);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let mut pager = Pager::new(&path);
        pager
            .attach(&AttachConfig {
                session_initiator: true,
                encryption_key: Some(b"secret"),
                ..AttachConfig::default()
            })
            .unwrap();
        pager.detach();

        let mut pager = Pager::new(&path);
        let err = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                encryption_key: Some(b"wrong"),
                ..AttachConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));

        let mut pager = Pager::new(&path);
        let err = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                ..AttachConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn unknown_format_tag_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut pager = Pager::new(&path);
        pager
            .attach(&AttachConfig {
                session_initiator: true,
                ..AttachConfig::default()
            })
            .unwrap();
        pager.detach();

        // Stamp a future format tag.
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        write_header(&file, 9, 0, 0, 0).unwrap();
        drop(file);

        let err = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                allow_file_format_upgrade: true,
                ..AttachConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileFormat { found: 9, .. }));
    }

    #[test]
    fn upgradable_tag_requires_permission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let mut pager = Pager::new(&path);
        pager
            .attach(&AttachConfig {
                session_initiator: true,
                ..AttachConfig::default()
            })
            .unwrap();
        pager.detach();

        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        write_header(&file, UPGRADABLE_TAG, 0, 0, 0).unwrap();
        drop(file);

        let err = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                allow_file_format_upgrade: false,
                ..AttachConfig::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedFileFormat {
                found: UPGRADABLE_TAG,
                ..
            }
        ));

        // With upgrades allowed the tag is rewritten in place.
        let info = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                allow_file_format_upgrade: true,
                ..AttachConfig::default()
            })
            .unwrap();
        assert_eq!(info.version, 1);
        pager.detach();

        let file = OpenOptions::new().read(true).open(&path).unwrap();
        assert_eq!(read_header(&file).unwrap().format_tag, FORMAT_TAG);
    }

    #[test]
    fn compacted_file_replaces_original() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pager, _) = attach_fresh(&dir);

        for v in 2..20u64 {
            let (top, _) = pager.write_snapshot(&vec![v as u8; 500], v, 1).unwrap();
            pager.sync_root(top).unwrap();
        }
        let big = std::fs::metadata(dir.path().join("db")).unwrap().len();
        pager.detach();

        let tmp = dir.path().join("db.tmp_compaction_space");
        pager.write_compacted(&tmp, &[19u8; 500], 19).unwrap();
        assert!(!tmp.exists());

        let info = pager
            .attach(&AttachConfig {
                session_initiator: true,
                no_create: true,
                allow_file_format_upgrade: true,
                ..AttachConfig::default()
            })
            .unwrap();
        assert_eq!(info.version, 19);
        assert_eq!(pager.read_payload(info.top_ref).unwrap(), vec![19u8; 500]);

        let small = std::fs::metadata(dir.path().join("db")).unwrap().len();
        assert!(small <= big);
    }
}
