//! Append-only commit log.
//!
//! ```text
//! header: magic "RKLG" | format u16 | encrypted u8 | key check [16]
//! frame:  len u32 | version u64 | checksum [4] | payload [len]
//! ```
//!
//! All integers are little-endian. The payload is the CBOR encoding of the
//! committed [`Group`], sealed with AES-GCM when the realm is encrypted; the
//! checksum is the first four bytes of its SHA-256. Only the last complete
//! frame matters: opening scans forward and stops at the first frame that
//! is short or fails its checksum.

use super::Snapshot;
use crate::crypto::{CryptoManager, EncryptionKey, KEY_CHECK_SIZE};
use crate::error::{CoreError, CoreResult, FileAccessKind};
use crate::group::Group;
use realmkit_storage::StorageBackend;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const MAGIC: [u8; 4] = *b"RKLG";

/// Version of the log layout and of the lock file line.
pub(crate) const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: u64 = 4 + 2 + 1 + KEY_CHECK_SIZE as u64;
const FRAME_HEADER_LEN: usize = 4 + 8 + 4;

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

pub(crate) struct CommitLog {
    backend: Box<dyn StorageBackend>,
    path: PathBuf,
    key_check: Option<[u8; KEY_CHECK_SIZE]>,
    crypto: Option<CryptoManager>,
    /// End of the last valid frame, or 0 before a header has been seen.
    end: u64,
    latest: Snapshot,
}

impl CommitLog {
    /// Opens the log, writing a header into an empty writable backend.
    pub(crate) fn open(
        mut backend: Box<dyn StorageBackend>,
        path: &Path,
        key: Option<&EncryptionKey>,
        writable: bool,
    ) -> CoreResult<Self> {
        let key_check = key.map(EncryptionKey::check_value);
        let size = backend.size()?;
        if size == 0 && writable {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(&MAGIC);
            header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            header.push(u8::from(key_check.is_some()));
            header.extend_from_slice(&key_check.unwrap_or([0u8; KEY_CHECK_SIZE]));
            backend.append(&header)?;
            backend.sync()?;
        }

        let mut log = Self {
            backend,
            path: path.to_path_buf(),
            key_check,
            crypto: key.map(CryptoManager::new),
            end: 0,
            latest: Snapshot::empty(),
        };
        log.refresh()?;

        let size = log.backend.size()?;
        if log.end != 0 && log.end < size {
            warn!(
                target: "realmkit::session",
                path = %log.path.display(),
                valid = log.end,
                size,
                "ignoring incomplete commit log tail"
            );
        }
        Ok(log)
    }

    /// The last committed state.
    pub(crate) fn latest(&self) -> &Snapshot {
        &self.latest
    }

    /// Picks up frames appended since the last scan, including by other
    /// processes. Returns true when a newer commit was found.
    pub(crate) fn refresh(&mut self) -> CoreResult<bool> {
        let size = self.backend.refresh()?;
        if self.end == 0 {
            if size == 0 {
                return Ok(false);
            }
            self.verify_header(size)?;
            self.end = HEADER_LEN;
        }
        if size <= self.end {
            return Ok(false);
        }
        self.scan(size)
    }

    fn verify_header(&self, size: u64) -> CoreResult<()> {
        let access = |message: &str| {
            CoreError::file_access(FileAccessKind::AccessError, &self.path, message)
        };
        if size < HEADER_LEN {
            return Err(access("file is too short to be a realm"));
        }

        let header = self.backend.read_at(0, HEADER_LEN as usize)?;
        if header[0..4] != MAGIC {
            return Err(access("not a realm file"));
        }
        let format = u16::from_le_bytes([header[4], header[5]]);
        if format != FORMAT_VERSION {
            return Err(access(&format!(
                "unsupported file format {format}, expected {FORMAT_VERSION}"
            )));
        }

        match (header[6] != 0, &self.key_check) {
            (true, None) => Err(access("realm file is encrypted but no key was supplied")),
            (false, Some(_)) => Err(access("realm file is not encrypted")),
            (true, Some(check)) if header[7..] != check[..] => {
                Err(access("invalid encryption key"))
            }
            _ => Ok(()),
        }
    }

    fn scan(&mut self, size: u64) -> CoreResult<bool> {
        let mut advanced = false;
        while self.end + FRAME_HEADER_LEN as u64 <= size {
            let head = self.backend.read_at(self.end, FRAME_HEADER_LEN)?;
            let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            let mut version = [0u8; 8];
            version.copy_from_slice(&head[4..12]);
            let version = u64::from_le_bytes(version);

            let frame_end = self.end + FRAME_HEADER_LEN as u64 + u64::from(len);
            if frame_end > size {
                debug!(target: "realmkit::session", offset = self.end, "commit frame not complete yet");
                break;
            }

            let payload = self
                .backend
                .read_at(self.end + FRAME_HEADER_LEN as u64, len as usize)?;
            if checksum(&payload) != head[12..16] {
                warn!(
                    target: "realmkit::session",
                    path = %self.path.display(),
                    offset = self.end,
                    "commit frame checksum mismatch"
                );
                break;
            }

            let group = self.decode(&payload)?;
            self.latest = Snapshot {
                version,
                group: Arc::new(group),
            };
            self.end = frame_end;
            advanced = true;
        }
        Ok(advanced)
    }

    fn decode(&self, payload: &[u8]) -> CoreResult<Group> {
        let plain;
        let bytes = match &self.crypto {
            Some(crypto) => {
                plain = crypto.decrypt(payload)?;
                plain.as_slice()
            }
            None => payload,
        };
        ciborium::from_reader(bytes)
            .map_err(|e| CoreError::corrupted(format!("undecodable commit: {e}")))
    }

    fn encode(&self, group: &Group) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(group, &mut bytes)
            .map_err(|e| CoreError::corrupted(format!("unencodable commit: {e}")))?;
        match &self.crypto {
            Some(crypto) => crypto.encrypt(&bytes),
            None => Ok(bytes),
        }
    }

    /// Appends `group` as commit `version`. Caller holds the writer lock.
    pub(crate) fn append(&mut self, version: u64, group: Group, sync: bool) -> CoreResult<()> {
        let size = self.backend.refresh()?;
        if size > self.end {
            self.backend.truncate(self.end)?;
        }

        let payload = self.encode(&group)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::corrupted("commit larger than 4 GiB"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&version.to_le_bytes());
        frame.extend_from_slice(&checksum(&payload));
        frame.extend_from_slice(&payload);

        self.backend.append(&frame)?;
        self.backend.flush()?;
        if sync {
            self.backend.sync()?;
        }

        self.end += frame.len() as u64;
        self.latest = Snapshot {
            version,
            group: Arc::new(group),
        };
        Ok(())
    }

    /// Rewrites the log as a single frame holding `group` at the latest
    /// version. Caller has exclusive access to the file.
    pub(crate) fn rewrite(&mut self, group: Group) -> CoreResult<u64> {
        let before = self.backend.refresh()?;
        self.backend.truncate(HEADER_LEN)?;
        self.end = HEADER_LEN;
        if self.latest.version > 0 {
            self.append(self.latest.version, group, true)?;
        } else {
            self.backend.sync()?;
        }
        Ok(before.saturating_sub(self.backend.size()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, Property, PropertyType};
    use realmkit_storage::InMemoryBackend;

    fn sample(rows: usize) -> Group {
        let mut group = Group::new();
        let table = group.add_table(&ObjectSchema::new(
            "Item",
            vec![Property::new("id", PropertyType::Int)],
        ));
        for _ in 0..rows {
            table.add_row();
        }
        group
    }

    fn open(data: Vec<u8>, key: Option<&EncryptionKey>) -> CoreResult<CommitLog> {
        CommitLog::open(
            Box::new(InMemoryBackend::with_data(data)),
            Path::new("test.realm"),
            key,
            true,
        )
    }

    fn bytes_of(log: &CommitLog) -> Vec<u8> {
        let size = log.backend.size().unwrap();
        log.backend.read_at(0, size as usize).unwrap()
    }

    #[test]
    fn empty_log_has_version_zero() {
        let log = open(Vec::new(), None).unwrap();
        assert_eq!(log.latest().version(), 0);
        assert_eq!(log.end, HEADER_LEN);
    }

    #[test]
    fn reopen_sees_last_commit() {
        let mut log = open(Vec::new(), None).unwrap();
        log.append(1, sample(1), false).unwrap();
        log.append(2, sample(2), false).unwrap();

        let reopened = open(bytes_of(&log), None).unwrap();
        assert_eq!(reopened.latest().version(), 2);
        assert_eq!(
            reopened.latest().group().table("Item").unwrap().row_count(),
            2
        );
    }

    #[test]
    fn torn_tail_is_ignored_and_overwritten() {
        let mut log = open(Vec::new(), None).unwrap();
        log.append(1, sample(1), false).unwrap();
        let mut data = bytes_of(&log);
        let good_len = data.len();
        data.extend_from_slice(&[9, 0, 0, 0, 2, 0]);

        let mut reopened = open(data, None).unwrap();
        assert_eq!(reopened.latest().version(), 1);
        reopened.append(2, sample(3), false).unwrap();
        assert!(bytes_of(&reopened).len() > good_len);

        let again = open(bytes_of(&reopened), None).unwrap();
        assert_eq!(again.latest().version(), 2);
    }

    #[test]
    fn corrupted_frame_stops_the_scan() {
        let mut log = open(Vec::new(), None).unwrap();
        log.append(1, sample(1), false).unwrap();
        log.append(2, sample(2), false).unwrap();
        let mut data = bytes_of(&log);
        let last = data.len() - 1;
        data[last] ^= 0xff;

        let reopened = open(data, None).unwrap();
        assert_eq!(reopened.latest().version(), 1);
    }

    #[test]
    fn encrypted_log_needs_the_right_key() {
        let key = EncryptionKey::generate();
        let mut log = open(Vec::new(), Some(&key)).unwrap();
        log.append(1, sample(1), false).unwrap();
        let data = bytes_of(&log);

        assert_eq!(open(data.clone(), Some(&key)).unwrap().latest().version(), 1);
        for attempt in [Some(EncryptionKey::generate()), None] {
            let err = open(data.clone(), attempt.as_ref()).err().unwrap();
            assert_eq!(err.file_access_kind(), Some(FileAccessKind::AccessError));
        }
    }

    #[test]
    fn foreign_files_are_rejected() {
        let err = open(b"definitely not a realm file".to_vec(), None)
            .err()
            .unwrap();
        assert_eq!(err.file_access_kind(), Some(FileAccessKind::AccessError));
    }

    #[test]
    fn rewrite_keeps_only_the_latest_frame() {
        let mut log = open(Vec::new(), None).unwrap();
        for version in 1..=5 {
            log.append(version, sample(version as usize), false).unwrap();
        }
        let latest = (*log.latest().group).clone();
        let reclaimed = log.rewrite(latest).unwrap();
        assert!(reclaimed > 0);

        let reopened = open(bytes_of(&log), None).unwrap();
        assert_eq!(reopened.latest().version(), 5);
        assert_eq!(
            reopened.latest().group().table("Item").unwrap().row_count(),
            5
        );
    }
}
