//! Storage session: snapshots and serialized write transactions over one
//! realm file.
//!
//! A session is shared by every handle of a coordinator. Readers hold
//! [`Snapshot`]s, which are immutable and cheap to clone. One writer at a
//! time, across threads and processes, holds a [`WriteTransaction`] built
//! on top of the latest commit.

mod lock;
mod log;

pub(crate) use lock::sidecar_path;

use crate::config::OpenConfig;
use crate::crypto::EncryptionKey;
use crate::error::{CoreError, CoreResult, FileAccessKind};
use crate::group::Group;
use lock::LockFile;
use log::CommitLog;
use parking_lot::{Condvar, Mutex};
use realmkit_storage::{FileBackend, InMemoryBackend, StorageBackend, StorageError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options the session needs from an [`OpenConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Never write; fail if the file is missing.
    pub read_only: bool,
    /// Keep everything in memory.
    pub in_memory: bool,
    /// Encryption key for the commit log.
    pub encryption_key: Option<EncryptionKey>,
    /// fsync every commit.
    pub sync_on_commit: bool,
}

impl From<&OpenConfig> for SessionOptions {
    fn from(config: &OpenConfig) -> Self {
        Self {
            read_only: config.read_only,
            in_memory: config.in_memory,
            encryption_key: config.encryption_key.clone(),
            sync_on_commit: config.sync_on_commit,
        }
    }
}

/// An immutable view of the realm at one commit.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    group: Arc<Group>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            group: Arc::new(Group::new()),
        }
    }

    /// Commit version this snapshot reads. Zero before the first commit.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The committed state.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    pub(crate) fn shared_group(&self) -> Arc<Group> {
        Arc::clone(&self.group)
    }
}

/// What moved between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Version before the advance.
    pub from_version: u64,
    /// Version after the advance.
    pub to_version: u64,
    /// Object types whose tables differ.
    pub changed_types: Vec<String>,
}

impl ChangeSet {
    /// Returns true when no object type changed, including when there was
    /// nothing to compare.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_types.is_empty()
    }
}

struct WriterGate {
    busy: Mutex<bool>,
    released: Condvar,
    file: Option<File>,
}

impl WriterGate {
    fn acquire(self: &Arc<Self>) -> CoreResult<WriterGuard> {
        {
            let mut busy = self.busy.lock();
            while *busy {
                self.released.wait(&mut busy);
            }
            *busy = true;
        }
        let guard = WriterGuard {
            gate: Arc::clone(self),
        };
        if let Some(file) = &self.file {
            fs2::FileExt::lock_exclusive(file)?;
        }
        Ok(guard)
    }

    fn try_acquire(self: &Arc<Self>) -> Option<WriterGuard> {
        let mut busy = self.busy.lock();
        if *busy {
            return None;
        }
        *busy = true;
        Some(WriterGuard {
            gate: Arc::clone(self),
        })
    }
}

struct WriterGuard {
    gate: Arc<WriterGate>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.gate.file {
            if let Err(e) = fs2::FileExt::unlock(file) {
                warn!(target: "realmkit::session", error = %e, "failed to release writer lock");
            }
        }
        *self.gate.busy.lock() = false;
        self.gate.released.notify_one();
    }
}

/// An open write transaction. Dropping it without committing discards it.
pub struct WriteTransaction {
    base: Snapshot,
    group: Group,
    _guard: WriterGuard,
}

impl WriteTransaction {
    /// The snapshot this transaction started from.
    #[must_use]
    pub fn base(&self) -> &Snapshot {
        &self.base
    }

    /// The pending state.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The pending state, for writing.
    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base_version", &self.base.version)
            .finish_non_exhaustive()
    }
}

/// One open realm file.
pub struct StorageSession {
    path: PathBuf,
    read_only: bool,
    in_memory: bool,
    sync_on_commit: bool,
    log: Mutex<CommitLog>,
    writer: Arc<WriterGate>,
    lock: Option<LockFile>,
}

impl StorageSession {
    /// Opens the realm at `path`.
    ///
    /// # Errors
    ///
    /// [`CoreError::FileAccess`] classified by cause: missing file for a
    /// read-only open, permissions, a lock file from an incompatible build,
    /// or a wrong encryption key.
    pub fn open(path: &Path, options: &SessionOptions) -> CoreResult<Self> {
        let open_err = |e: StorageError| match e {
            StorageError::Io(io) => CoreError::from_open_io(path, &io),
            other => CoreError::Storage(other),
        };

        let (backend, lock, writer_file) = if options.in_memory {
            (Box::new(InMemoryBackend::new()) as Box<dyn StorageBackend>, None, None)
        } else if options.read_only {
            if !path.exists() {
                return Err(CoreError::file_access(
                    FileAccessKind::AccessError,
                    path,
                    "file does not exist and the realm is read-only",
                ));
            }
            let backend = FileBackend::open_read_only(path).map_err(open_err)?;
            (Box::new(backend) as Box<dyn StorageBackend>, Some(LockFile::acquire(path)?), None)
        } else {
            let backend = FileBackend::open_with_create_dirs(path).map_err(open_err)?;
            let lock = LockFile::acquire(path)?;
            let writer = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(sidecar_path(path, "writer"))
                .map_err(|e| CoreError::from_open_io(path, &e))?;
            (Box::new(backend) as Box<dyn StorageBackend>, Some(lock), Some(writer))
        };

        let log = CommitLog::open(
            backend,
            path,
            options.encryption_key.as_ref(),
            !options.read_only,
        )?;

        info!(
            target: "realmkit::session",
            path = %path.display(),
            version = log.latest().version,
            read_only = options.read_only,
            in_memory = options.in_memory,
            "session opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            read_only: options.read_only,
            in_memory: options.in_memory,
            sync_on_commit: options.sync_on_commit,
            log: Mutex::new(log),
            writer: Arc::new(WriterGate {
                busy: Mutex::new(false),
                released: Condvar::new(),
                file: writer_file,
            }),
            lock,
        })
    }

    /// Path of the realm file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the session was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the session keeps its data in memory.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    fn latest(&self) -> CoreResult<Snapshot> {
        let mut log = self.log.lock();
        log.refresh()?;
        Ok(log.latest().clone())
    }

    /// Version of the newest commit, including other processes' commits.
    pub fn latest_version(&self) -> CoreResult<u64> {
        Ok(self.latest()?.version)
    }

    /// Opens a read snapshot at the latest commit.
    pub fn begin_read(&self) -> CoreResult<Snapshot> {
        let snapshot = self.latest()?;
        debug!(target: "realmkit::session", version = snapshot.version, "read began");
        Ok(snapshot)
    }

    /// Releases a read snapshot.
    pub fn end_read(&self, snapshot: Snapshot) {
        debug!(target: "realmkit::session", version = snapshot.version, "read ended");
    }

    /// Returns true if something was committed after `version`.
    pub fn has_changed(&self, version: u64) -> CoreResult<bool> {
        Ok(self.latest_version()? != version)
    }

    /// Moves `snapshot` to the latest commit and reports what changed.
    pub fn advance_read(&self, snapshot: &mut Snapshot) -> CoreResult<ChangeSet> {
        let latest = self.latest()?;
        let changes = ChangeSet {
            from_version: snapshot.version,
            to_version: latest.version,
            changed_types: latest.group.changed_tables(&snapshot.group),
        };
        debug!(
            target: "realmkit::session",
            from = changes.from_version,
            to = changes.to_version,
            "read advanced"
        );
        *snapshot = latest;
        Ok(changes)
    }

    /// Starts a write transaction, blocking until no other writer is active.
    ///
    /// `snapshot` is advanced to the commit the transaction starts from.
    pub fn begin_write(&self, snapshot: &mut Snapshot) -> CoreResult<WriteTransaction> {
        if self.read_only {
            return Err(CoreError::invalid_transaction(
                "can't write to a read-only session",
            ));
        }
        let guard = self.writer.acquire()?;
        *snapshot = self.latest()?;
        Ok(WriteTransaction {
            base: snapshot.clone(),
            group: (*snapshot.group).clone(),
            _guard: guard,
        })
    }

    /// Commits `txn` and moves `snapshot` to the new commit.
    ///
    /// Returns the new version.
    pub fn commit_write(&self, txn: WriteTransaction, snapshot: &mut Snapshot) -> CoreResult<u64> {
        let WriteTransaction { base, group, _guard } = txn;
        let mut log = self.log.lock();
        let version = log.latest().version + 1;
        log.append(version, group, self.sync_on_commit)?;
        *snapshot = log.latest().clone();
        drop(log);

        debug!(
            target: "realmkit::session",
            from = base.version,
            version,
            "write committed"
        );
        Ok(version)
    }

    /// Discards `txn`.
    pub fn cancel_write(&self, txn: WriteTransaction) {
        debug!(target: "realmkit::session", base = txn.base.version, "write canceled");
    }

    /// Rewrites the file to hold only the latest commit.
    ///
    /// `optimize` may tidy the group before it is written. Returns false
    /// without doing anything while a write is active in this process or
    /// another process has the file open.
    pub fn compact(&self, optimize: impl FnOnce(&mut Group)) -> CoreResult<bool> {
        if self.read_only {
            return Ok(false);
        }
        let Some(_guard) = self.writer.try_acquire() else {
            return Ok(false);
        };
        if let Some(lock) = &self.lock {
            if !lock.try_upgrade()? {
                return Ok(false);
            }
        }

        let result = {
            let mut log = self.log.lock();
            log.refresh().and_then(|_| {
                let mut group = (*log.latest().group).clone();
                optimize(&mut group);
                log.rewrite(group)
            })
        };

        if let Some(lock) = &self.lock {
            lock.downgrade()?;
        }
        let reclaimed = result?;
        info!(
            target: "realmkit::session",
            path = %self.path.display(),
            reclaimed,
            "file compacted"
        );
        Ok(true)
    }
}

impl std::fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSession")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            .finish_non_exhaustive()
    }
}
