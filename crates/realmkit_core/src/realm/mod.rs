//! Thread-confined realm handles.
//!
//! A [`Realm`] is one thread's view of a realm file: its schema, its read
//! snapshot and, while writing, its write transaction. Handles are shared
//! as [`SharedRealm`] (`Arc<Realm>`) and may be moved between threads, but
//! every operation checks that it runs on the thread that opened the
//! handle and fails with [`CoreError::WrongThread`] otherwise.
//!
//! ```text
//!            ensure_read            begin_transaction
//!   Closed ──────────────▶ Reading ───────────────────▶ Writing
//!     ▲                     │  ▲      commit / cancel      │
//!     └──── invalidate ─────┘  └───────────────────────────┘
//! ```

mod migration;

use crate::config::OpenConfig;
use crate::coordinator::RealmCoordinator;
use crate::delegate::RealmDelegate;
use crate::error::{CoreError, CoreResult};
use crate::group::Group;
use crate::notifier::CommitNotice;
use crate::object_store::{self, GroupAccess};
use crate::schema::{Schema, SchemaVersion};
use crate::session::{ChangeSet, Snapshot, StorageSession, WriteTransaction};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A shared reference to a realm handle.
pub type SharedRealm = Arc<Realm>;

/// Unique identity of a realm handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Creates a random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No snapshot open.
    Closed,
    /// Reading a snapshot.
    Reading,
    /// Inside a write transaction.
    Writing,
}

struct RealmState {
    schema: Option<Arc<Schema>>,
    schema_version: SchemaVersion,
    snapshot: Option<Snapshot>,
    /// Newest commit version this handle has observed.
    last_seen: u64,
    writing: bool,
    /// Taken out while a `write` closure runs.
    write: Option<WriteTransaction>,
    auto_refresh: bool,
    delegate: Option<Arc<dyn RealmDelegate>>,
    notices: Option<Receiver<CommitNotice>>,
}

impl RealmState {
    fn new(notices: Option<Receiver<CommitNotice>>) -> Self {
        Self {
            schema: None,
            schema_version: SchemaVersion::Unversioned,
            snapshot: None,
            last_seen: 0,
            writing: false,
            write: None,
            auto_refresh: true,
            delegate: None,
            notices,
        }
    }
}

/// One thread's handle on a realm file.
pub struct Realm {
    id: HandleId,
    thread: ThreadId,
    config: OpenConfig,
    coordinator: Arc<RealmCoordinator>,
    session: Arc<StorageSession>,
    registered: AtomicBool,
    state: ReentrantMutex<RefCell<RealmState>>,
}

impl Realm {
    /// Creates and initializes a handle. Called by the coordinator with no
    /// lock held; the handle is registered only after this returns.
    pub(crate) fn open(
        coordinator: Arc<RealmCoordinator>,
        session: Arc<StorageSession>,
        config: OpenConfig,
        canonical: Option<(Arc<Schema>, SchemaVersion)>,
    ) -> CoreResult<Self> {
        let id = HandleId::new();
        let notices = coordinator.subscribe(id);
        let realm = Self {
            id,
            thread: thread::current().id(),
            config,
            coordinator,
            session,
            registered: AtomicBool::new(false),
            state: ReentrantMutex::new(RefCell::new(RealmState::new(notices))),
        };
        realm.init(canonical)?;
        Ok(realm)
    }

    fn init(&self, canonical: Option<(Arc<Schema>, SchemaVersion)>) -> CoreResult<()> {
        if let Some((schema, version)) = canonical {
            self.with_state(|s| {
                s.schema = Some(schema);
                s.schema_version = version;
            });
            return Ok(());
        }

        let (disk_schema, disk_version) =
            self.read(|g| (Arc::new(object_store::schema_from_group(g)), g.schema_version()))?;
        self.with_state(|s| {
            s.schema = Some(Arc::clone(&disk_schema));
            s.schema_version = disk_version;
        });

        let Some(target) = self.config.schema.clone() else {
            return Ok(());
        };
        if self.config.read_only {
            if !disk_version.is_versioned() {
                return Err(CoreError::UninitializedFile {
                    path: self.config.path.clone(),
                });
            }
            target.validate()?;
            object_store::verify_schema(&disk_schema, &target, true)?;
            self.with_state(|s| s.schema = Some(target));
            Ok(())
        } else {
            self.apply_schema(target, self.config.schema_version, false)
                .map(|_| ())
        }
    }

    /// A read-only handle pinned to `snapshot`, used as the "before" view of
    /// a migration. It is not registered with the coordinator.
    pub(crate) fn detached_view(
        &self,
        snapshot: Snapshot,
        schema: Option<Arc<Schema>>,
        schema_version: SchemaVersion,
    ) -> Self {
        let config = OpenConfig {
            read_only: true,
            cache: false,
            schema: schema.clone(),
            schema_version,
            migration: None,
            ..self.config.clone()
        };
        let mut state = RealmState::new(None);
        state.schema = schema;
        state.schema_version = schema_version;
        state.last_seen = snapshot.version();
        state.snapshot = Some(snapshot);
        state.auto_refresh = false;

        Self {
            id: HandleId::new(),
            thread: self.thread,
            config,
            coordinator: Arc::clone(&self.coordinator),
            session: Arc::clone(&self.session),
            registered: AtomicBool::new(false),
            state: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Runs `f` on the state. `f` must not call back into the handle.
    fn with_state<R>(&self, f: impl FnOnce(&mut RealmState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn verify_thread(&self) -> CoreResult<()> {
        if thread::current().id() != self.thread {
            return Err(CoreError::WrongThread);
        }
        Ok(())
    }

    fn check_read_write(&self) -> CoreResult<()> {
        if self.config.read_only {
            return Err(CoreError::invalid_transaction(
                "can't perform transactions on read-only realms",
            ));
        }
        Ok(())
    }

    fn open_read<'a>(&self, s: &'a mut RealmState) -> CoreResult<&'a mut Snapshot> {
        let snapshot = match s.snapshot.take() {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = self.session.begin_read()?;
                s.last_seen = s.last_seen.max(snapshot.version());
                snapshot
            }
        };
        Ok(s.snapshot.insert(snapshot))
    }

    /// Identity of this handle.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The thread this handle is confined to.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// The config this handle was opened with.
    #[must_use]
    pub fn config(&self) -> &OpenConfig {
        &self.config
    }

    /// The coordinator this handle belongs to.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<RealmCoordinator> {
        &self.coordinator
    }

    /// Current schema.
    #[must_use]
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.with_state(|s| s.schema.clone())
    }

    /// Current schema version.
    #[must_use]
    pub fn schema_version(&self) -> SchemaVersion {
        self.with_state(|s| s.schema_version)
    }

    /// Current transaction state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.with_state(|s| {
            if s.writing {
                TransactionState::Writing
            } else if s.snapshot.is_some() {
                TransactionState::Reading
            } else {
                TransactionState::Closed
            }
        })
    }

    /// Returns true while a write transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.with_state(|s| s.writing)
    }

    /// Whether [`Realm::notify`] advances the snapshot by itself.
    #[must_use]
    pub fn auto_refresh(&self) -> bool {
        self.with_state(|s| s.auto_refresh)
    }

    /// Sets whether [`Realm::notify`] advances the snapshot by itself.
    pub fn set_auto_refresh(&self, value: bool) -> CoreResult<()> {
        self.verify_thread()?;
        self.with_state(|s| s.auto_refresh = value);
        Ok(())
    }

    /// Installs or removes the change delegate.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn RealmDelegate>>) -> CoreResult<()> {
        self.verify_thread()?;
        self.with_state(|s| s.delegate = delegate);
        Ok(())
    }

    /// Opens a read snapshot if none is open.
    ///
    /// # Errors
    ///
    /// [`CoreError::WrongThread`] and session errors.
    pub fn ensure_read(&self) -> CoreResult<()> {
        self.verify_thread()?;
        self.with_state(|s| self.open_read(s).map(|_| ()))
    }

    /// Starts a write transaction at the latest commit.
    ///
    /// Blocks while another handle or process is writing.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransactionState`] on read-only handles or when
    /// already writing.
    pub fn begin_transaction(&self) -> CoreResult<()> {
        self.check_read_write()?;
        self.verify_thread()?;
        self.with_state(|s| {
            if s.writing {
                return Err(CoreError::invalid_transaction(
                    "the realm is already in a write transaction",
                ));
            }
            let snapshot = self.open_read(s)?;
            let txn = self.session.begin_write(snapshot)?;
            s.last_seen = s.last_seen.max(txn.base().version());
            s.write = Some(txn);
            s.writing = true;
            Ok(())
        })
    }

    /// Commits the write transaction and notifies other handles.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransactionState`] when not writing, and session
    /// errors; the transaction is discarded if the commit fails.
    pub fn commit_transaction(&self) -> CoreResult<()> {
        self.check_read_write()?;
        self.verify_thread()?;
        let version = self.with_state(|s| {
            if !s.writing {
                return Err(CoreError::invalid_transaction(
                    "can't commit a non-existing write transaction",
                ));
            }
            let Some(txn) = s.write.take() else {
                return Err(CoreError::invalid_transaction(
                    "can't commit from inside a write closure",
                ));
            };
            s.writing = false;
            let snapshot = s.snapshot.get_or_insert_with(|| txn.base().clone());
            let version = self.session.commit_write(txn, snapshot)?;
            s.last_seen = version;
            Ok(version)
        })?;

        debug!(target: "realmkit::realm", handle = %self.id, version, "committed");
        self.coordinator.send_commit_notifications(self.id);
        Ok(())
    }

    /// Discards the write transaction.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransactionState`] when not writing.
    pub fn cancel_transaction(&self) -> CoreResult<()> {
        self.check_read_write()?;
        self.verify_thread()?;
        self.with_state(|s| {
            if !s.writing {
                return Err(CoreError::invalid_transaction(
                    "can't cancel a non-existing write transaction",
                ));
            }
            let Some(txn) = s.write.take() else {
                return Err(CoreError::invalid_transaction(
                    "can't cancel from inside a write closure",
                ));
            };
            s.writing = false;
            self.session.cancel_write(txn);
            Ok(())
        })
    }

    /// Cancels any write and releases the snapshot.
    pub fn invalidate(&self) -> CoreResult<()> {
        self.verify_thread()?;
        let (txn, snapshot) = self.with_state(|s| {
            s.writing = false;
            (s.write.take(), s.snapshot.take())
        });
        if let Some(txn) = txn {
            self.session.cancel_write(txn);
        }
        if let Some(snapshot) = snapshot {
            self.session.end_read(snapshot);
        }
        Ok(())
    }

    /// Reacts to commits made elsewhere.
    ///
    /// If something was committed since this handle last looked, the
    /// delegate's `changes_available` runs first. Then, with auto-refresh,
    /// an open snapshot advances to the latest commit and `did_change`
    /// reports the changes; a closed handle reports an empty change set.
    pub fn notify(&self) -> CoreResult<()> {
        self.verify_thread()?;
        let last_seen = self.with_state(|s| s.last_seen);
        if !self.session.has_changed(last_seen)? {
            return Ok(());
        }

        if let Some(delegate) = self.with_state(|s| s.delegate.clone()) {
            delegate.changes_available();
        }

        if !self.auto_refresh() {
            return Ok(());
        }
        let changes = self.with_state(|s| -> CoreResult<Option<ChangeSet>> {
            if s.writing {
                return Ok(None);
            }
            if let Some(snapshot) = s.snapshot.as_mut() {
                let changes = self.session.advance_read(snapshot)?;
                s.last_seen = changes.to_version;
                return Ok(Some(changes));
            }
            s.last_seen = self.session.latest_version()?;
            Ok(Some(ChangeSet::default()))
        })?;

        if let (Some(changes), Some(delegate)) = (changes, self.with_state(|s| s.delegate.clone()))
        {
            delegate.did_change(&changes);
        }
        Ok(())
    }

    /// Advances to the latest commit.
    ///
    /// Returns false while writing or when nothing new was committed. A
    /// closed handle opens a snapshot.
    pub fn refresh(&self) -> CoreResult<bool> {
        self.verify_thread()?;
        let (refreshed, advanced) = self.with_state(|s| -> CoreResult<(bool, Option<ChangeSet>)> {
            if s.writing || !self.session.has_changed(s.last_seen)? {
                return Ok((false, None));
            }
            if let Some(snapshot) = s.snapshot.as_mut() {
                let changes = self.session.advance_read(snapshot)?;
                s.last_seen = changes.to_version;
                return Ok((true, Some(changes)));
            }
            let version = self.open_read(s)?.version();
            s.last_seen = version;
            Ok((true, None))
        })?;

        if let (Some(changes), Some(delegate)) = (advanced, self.with_state(|s| s.delegate.clone()))
        {
            delegate.did_change(&changes);
        }
        Ok(refreshed)
    }

    /// Rewrites the file to reclaim space.
    ///
    /// Optimizes every table of the current schema and releases the
    /// snapshot first. Returns false if the file could not be compacted
    /// because another writer or process is active.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransactionState`] on read-only handles and
    /// while writing.
    pub fn compact(&self) -> CoreResult<bool> {
        self.verify_thread()?;
        if self.config.read_only {
            return Err(CoreError::invalid_transaction(
                "can't compact a read-only realm",
            ));
        }
        if self.is_in_transaction() {
            return Err(CoreError::invalid_transaction(
                "can't compact a realm within a write transaction",
            ));
        }

        let schema = self.schema();
        if let Some(snapshot) = self.with_state(|s| s.snapshot.take()) {
            self.session.end_read(snapshot);
        }
        self.session.compact(|group| {
            for object_schema in schema.iter().flat_map(|s| s.iter()) {
                if let Ok(table) = group.table_mut(&object_schema.name) {
                    table.optimize();
                }
            }
        })
    }

    /// Runs `f` against the current state: the pending write while
    /// writing, the read snapshot otherwise.
    pub fn read<R>(&self, f: impl FnOnce(&Group) -> R) -> CoreResult<R> {
        self.verify_thread()?;
        let group = self.with_state(|s| -> CoreResult<Arc<Group>> {
            if let Some(txn) = &s.write {
                return Ok(Arc::new(txn.group().clone()));
            }
            Ok(self.open_read(s)?.shared_group())
        })?;
        Ok(f(&group))
    }

    /// Runs `f` against the pending write.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTransactionState`] outside a write transaction
    /// or when nested in another `write`; otherwise whatever `f` returns.
    pub fn write<R>(&self, f: impl FnOnce(&mut Group) -> CoreResult<R>) -> CoreResult<R> {
        self.verify_thread()?;
        let mut txn = self.with_state(|s| {
            if !s.writing {
                return Err(CoreError::invalid_transaction(
                    "can't write outside a write transaction",
                ));
            }
            s.write.take().ok_or_else(|| {
                CoreError::invalid_transaction("the write transaction is already in use")
            })
        })?;

        let result = f(txn.group_mut());

        let orphaned = self.with_state(|s| {
            if s.writing {
                s.write = Some(txn);
                None
            } else {
                Some(txn)
            }
        });
        if let Some(txn) = orphaned {
            self.session.cancel_write(txn);
        }
        result
    }

    /// Runs `f` in a write transaction, committing on `Ok` and canceling on
    /// `Err`.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Group) -> CoreResult<R>) -> CoreResult<R> {
        self.begin_transaction()?;
        match self.write(f) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                if self.is_in_transaction() {
                    if let Err(cancel) = self.cancel_transaction() {
                        warn!(target: "realmkit::realm", error = %cancel, "failed to cancel transaction");
                    }
                }
                Err(e)
            }
        }
    }

    /// Drains queued commit notices and returns how many there were.
    pub fn pending_commit_notices(&self) -> CoreResult<usize> {
        self.verify_thread()?;
        Ok(self.with_state(|s| s.notices.as_ref().map_or(0, |rx| rx.try_iter().count())))
    }

    /// Waits up to `timeout` for another handle or process to commit, then
    /// runs [`Realm::notify`]. Returns false on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> CoreResult<bool> {
        self.verify_thread()?;
        let received = self.with_state(|s| {
            let Some(rx) = &s.notices else {
                return false;
            };
            let received = rx.try_recv().is_ok() || rx.recv_timeout(timeout).is_ok();
            if received {
                rx.try_iter().for_each(drop);
            }
            received
        });
        if received {
            self.notify()?;
        }
        Ok(received)
    }
}

impl GroupAccess for Realm {
    fn with_group(&self, f: &mut dyn FnMut(&mut Group) -> CoreResult<()>) -> CoreResult<()> {
        self.write(|group| f(group))
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.id)
            .field("path", &self.config.path)
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        state.writing = false;
        if let Some(txn) = state.write.take() {
            debug!(target: "realmkit::realm", handle = %self.id, "write canceled on close");
            self.session.cancel_write(txn);
        }
        if let Some(snapshot) = state.snapshot.take() {
            self.session.end_read(snapshot);
        }

        if *self.registered.get_mut() {
            self.coordinator.unregister_realm(self.id);
        } else {
            self.coordinator.remove_from_notifier(self.id);
        }
    }
}
