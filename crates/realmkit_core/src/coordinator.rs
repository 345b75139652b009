//! Per-path coordinator: owns the storage session and notifier of one realm
//! file and hands out handles that agree on its configuration.

use crate::config::{MigrationFunction, OpenConfig};
use crate::error::{CoreError, CoreResult};
use crate::notifier::{CommitNotice, Notifier};
use crate::realm::{HandleId, Realm, SharedRealm};
use crate::registry;
use crate::schema::{Schema, SchemaVersion};
use crate::session::{SessionOptions, StorageSession};
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, info};

struct RealmEntry {
    id: HandleId,
    thread: ThreadId,
    cacheable: bool,
    realm: Weak<Realm>,
}

#[derive(Default)]
struct CoordinatorState {
    /// Config of the first successful open; later opens must be compatible
    /// with it.
    config: Option<OpenConfig>,
    realms: Vec<RealmEntry>,
    /// `get_realm` calls between claiming the registry entry and
    /// registering their handle.
    pending_opens: usize,
    /// Set while the first handle is being built outside the lock.
    initializing: bool,
}

impl CoordinatorState {
    fn has_live_realms(&self) -> bool {
        self.realms.iter().any(|e| e.realm.strong_count() > 0)
    }

    fn is_idle(&self) -> bool {
        self.realms.is_empty() && self.pending_opens == 0
    }
}

/// Session and notifier shared by every handle on the path.
struct Engine {
    session: Arc<StorageSession>,
    notifier: Arc<Notifier>,
}

/// Schema and version a coordinator published before a schema update.
pub(crate) type PublishedSchema = (Option<Arc<Schema>>, SchemaVersion);

/// Coordinates every handle opened on one realm path.
///
/// Lock order is registry, then `state`, then `engine`. Handles are built
/// with no lock held, so schema migrations waiting on the writer never
/// block other handles from closing.
pub struct RealmCoordinator {
    path: PathBuf,
    state: Mutex<CoordinatorState>,
    initialized: Condvar,
    engine: RwLock<Option<Engine>>,
}

impl RealmCoordinator {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(CoordinatorState::default()),
            initialized: Condvar::new(),
            engine: RwLock::new(None),
        }
    }

    /// Normalized path of the realm file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a handle for `config`.
    ///
    /// The first successful call adopts `config` as canonical and opens the
    /// session; if building that first handle fails, the coordinator is
    /// left as if it had never been opened. Later calls must agree with the
    /// canonical config on read-only mode, in-memory mode, encryption key
    /// and schema version (unless unversioned), and replace its migration
    /// callback. With `config.cache`, a handle the calling thread already
    /// holds is returned instead of a new one.
    ///
    /// If the registry no longer maps the path to this coordinator, it is
    /// registered again; if it maps to another live coordinator, the call
    /// is forwarded there.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigMismatch`], session open failures, and schema
    /// errors from initializing a new handle.
    pub fn get_realm(self: &Arc<Self>, config: OpenConfig) -> CoreResult<SharedRealm> {
        if let Some(current) = self.claim_path() {
            return current.get_realm(config);
        }
        let result = self.open_handle(config);
        self.state.lock().pending_opens -= 1;
        result
    }

    /// Makes sure the registry maps this path to `self` and records a
    /// pending open, atomically with respect to `unregister_realm`.
    fn claim_path(self: &Arc<Self>) -> Option<Arc<Self>> {
        let mut map = registry::lock();
        if let Some(current) = registry::claim(&mut map, &self.path, self) {
            return Some(current);
        }
        self.state.lock().pending_opens += 1;
        None
    }

    fn open_handle(self: &Arc<Self>, config: OpenConfig) -> CoreResult<SharedRealm> {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        while state.initializing {
            self.initialized.wait(&mut state);
        }

        let first = state.config.is_none();
        let session = if first {
            let session = self.start_engine(&config)?;
            state.initializing = true;
            session
        } else {
            if let Some(canonical) = state.config.as_mut() {
                check_compatible(canonical, &config, &self.path)?;
                canonical.migration = config.migration.clone();
            }
            self.current_session()?
        };

        state.realms.retain(|e| e.realm.strong_count() > 0);
        if config.cache && !first {
            let cached = state
                .realms
                .iter()
                .filter(|e| e.cacheable && e.thread == thread)
                .find_map(|e| e.realm.upgrade());
            if let Some(realm) = cached {
                debug!(
                    target: "realmkit::coordinator",
                    path = %self.path.display(),
                    handle = %realm.id(),
                    "cached handle reused"
                );
                return Ok(realm);
            }
        }

        let canonical = if state.has_live_realms() {
            state
                .config
                .as_ref()
                .and_then(|c| c.schema.clone().map(|s| (s, c.schema_version)))
        } else {
            None
        };
        let adopted = canonical.is_some();
        let cacheable = config.cache;
        let first_config = first.then(|| config.clone());
        drop(state);

        let opened = Realm::open(Arc::clone(self), session, config, canonical);

        let mut state = self.state.lock();
        if first {
            state.initializing = false;
            self.initialized.notify_all();
        }
        let realm = match opened {
            Ok(realm) => Arc::new(realm),
            Err(e) => {
                if first {
                    *self.engine.write() = None;
                    debug!(
                        target: "realmkit::coordinator",
                        path = %self.path.display(),
                        error = %e,
                        "first open failed, session closed"
                    );
                }
                return Err(e);
            }
        };

        if first_config.is_some() {
            state.config = first_config;
        }
        if !adopted {
            if let Some(canonical) = state.config.as_mut() {
                canonical.schema = realm.schema();
                canonical.schema_version = realm.schema_version();
            }
        }
        state.realms.push(RealmEntry {
            id: realm.id(),
            thread,
            cacheable,
            realm: Arc::downgrade(&realm),
        });
        realm.mark_registered();

        debug!(
            target: "realmkit::coordinator",
            path = %self.path.display(),
            handle = %realm.id(),
            live = state.realms.len(),
            "handle opened"
        );
        Ok(realm)
    }

    fn start_engine(&self, config: &OpenConfig) -> CoreResult<Arc<StorageSession>> {
        let session = Arc::new(StorageSession::open(
            &self.path,
            &SessionOptions::from(config),
        )?);
        let notifier = Notifier::start(&self.path, config.in_memory, config.notify_poll_interval)?;
        *self.engine.write() = Some(Engine {
            session: Arc::clone(&session),
            notifier,
        });
        Ok(session)
    }

    fn current_session(&self) -> CoreResult<Arc<StorageSession>> {
        self.session()
            .ok_or_else(|| CoreError::invalid_transaction("coordinator has no open session"))
    }

    fn notifier(&self) -> Option<Arc<Notifier>> {
        self.engine.read().as_ref().map(|e| Arc::clone(&e.notifier))
    }

    /// Forgets a closing handle and, if it was the last one and no open is
    /// in flight, removes this coordinator from the registry.
    pub(crate) fn unregister_realm(&self, id: HandleId) {
        self.remove_from_notifier(id);
        {
            let mut state = self.state.lock();
            state
                .realms
                .retain(|e| e.id != id && e.realm.strong_count() > 0);
            if !state.is_idle() {
                return;
            }
        }

        // Registry before coordinator; re-check, a new open may have raced in.
        let mut map = registry::lock();
        let state = self.state.lock();
        if !state.is_idle() {
            return;
        }
        if registry::remove_if_current(&mut map, &self.path, self) {
            info!(
                target: "realmkit::coordinator",
                path = %self.path.display(),
                "last handle closed, coordinator released"
            );
        }
    }

    pub(crate) fn subscribe(&self, id: HandleId) -> Option<Receiver<CommitNotice>> {
        self.notifier().map(|n| n.add_realm(id))
    }

    pub(crate) fn remove_from_notifier(&self, id: HandleId) {
        if let Some(notifier) = self.notifier() {
            notifier.remove_realm(id);
        }
    }

    /// Tells every other handle and process that `source` committed.
    pub fn send_commit_notifications(&self, source: HandleId) {
        if let Some(notifier) = self.notifier() {
            notifier.notify_others(source);
        }
    }

    /// Canonical schema, while at least one handle is live.
    #[must_use]
    pub fn schema(&self) -> Option<Arc<Schema>> {
        let state = self.state.lock();
        if !state.has_live_realms() {
            return None;
        }
        state.config.as_ref().and_then(|c| c.schema.clone())
    }

    /// Canonical schema version, while at least one handle is live.
    #[must_use]
    pub fn schema_version(&self) -> Option<SchemaVersion> {
        let state = self.state.lock();
        if !state.has_live_realms() {
            return None;
        }
        state.config.as_ref().map(|c| c.schema_version)
    }

    /// The migration callback of the most recent open.
    #[must_use]
    pub fn migration_function(&self) -> Option<MigrationFunction> {
        self.state
            .lock()
            .config
            .as_ref()
            .and_then(|c| c.migration.clone())
    }

    /// Number of live handles.
    #[must_use]
    pub fn live_realm_count(&self) -> usize {
        self.state
            .lock()
            .realms
            .iter()
            .filter(|e| e.realm.strong_count() > 0)
            .count()
    }

    /// The shared storage session, once the first handle has been opened.
    #[must_use]
    pub fn session(&self) -> Option<Arc<StorageSession>> {
        self.engine.read().as_ref().map(|e| Arc::clone(&e.session))
    }

    /// Installs `schema` as canonical and returns what it replaced.
    pub(crate) fn publish_schema(
        &self,
        schema: Arc<Schema>,
        version: SchemaVersion,
    ) -> PublishedSchema {
        let mut state = self.state.lock();
        let Some(config) = state.config.as_mut() else {
            return (None, SchemaVersion::Unversioned);
        };
        let previous = (config.schema.replace(schema), config.schema_version);
        config.schema_version = version;
        previous
    }

    /// Reinstates a schema returned by [`RealmCoordinator::publish_schema`].
    pub(crate) fn restore_schema(&self, (schema, version): PublishedSchema) {
        if let Some(config) = self.state.lock().config.as_mut() {
            config.schema = schema;
            config.schema_version = version;
        }
    }
}

impl std::fmt::Debug for RealmCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmCoordinator")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn check_compatible(canonical: &OpenConfig, config: &OpenConfig, path: &Path) -> CoreResult<()> {
    let at = path.display();
    if canonical.read_only != config.read_only {
        return Err(CoreError::config_mismatch(format!(
            "realm at path '{at}' already opened with different read permissions"
        )));
    }
    if canonical.in_memory != config.in_memory {
        return Err(CoreError::config_mismatch(format!(
            "realm at path '{at}' already opened with different in-memory settings"
        )));
    }
    if canonical.encryption_key != config.encryption_key {
        return Err(CoreError::config_mismatch(format!(
            "realm at path '{at}' already opened with a different encryption key"
        )));
    }
    if config.schema_version.is_versioned() && canonical.schema_version != config.schema_version {
        return Err(CoreError::config_mismatch(format!(
            "realm at path '{at}' already opened with different schema version"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionKey, KEY_SIZE};
    use crate::get_shared_realm;
    use crate::schema::{ObjectSchema, Property, PropertyType};
    use proptest::prelude::*;
    use tempfile::tempdir;

    /// (read_only, in_memory, key seed, schema version)
    type Options = (bool, bool, Option<u8>, Option<u64>);

    fn options_strategy() -> impl Strategy<Value = Options> {
        (
            any::<bool>(),
            any::<bool>(),
            prop::option::of(0u8..2),
            prop::option::of(0u64..3),
        )
    }

    fn config_from((read_only, in_memory, key, version): Options) -> OpenConfig {
        let mut config = OpenConfig::new("compat.realm")
            .read_only(read_only)
            .in_memory(in_memory);
        if let Some(seed) = key {
            config = config.encryption_key(EncryptionKey::from_bytes(&[seed; KEY_SIZE]).unwrap());
        }
        if let Some(version) = version {
            config = config.schema_version(SchemaVersion::Versioned(version));
        }
        config
    }

    proptest! {
        #[test]
        fn mismatch_exactly_when_an_option_differs(
            canonical in options_strategy(),
            requested in options_strategy(),
        ) {
            let result = check_compatible(
                &config_from(canonical),
                &config_from(requested),
                Path::new("compat.realm"),
            );
            let differs = canonical.0 != requested.0
                || canonical.1 != requested.1
                || canonical.2 != requested.2
                || (requested.3.is_some() && canonical.3 != requested.3);

            prop_assert_eq!(result.is_err(), differs);
            if let Err(e) = result {
                prop_assert!(e.is_config_mismatch());
            }
        }
    }

    fn items() -> Schema {
        Schema::new(vec![ObjectSchema::new(
            "Item",
            vec![Property::new("id", PropertyType::Int)],
        )])
    }

    #[test]
    fn same_thread_gets_the_cached_handle() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm"));
        let a = get_shared_realm(config.clone()).unwrap();
        let b = get_shared_realm(config.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = get_shared_realm(config.cache(false)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.coordinator().live_realm_count(), 2);
    }

    #[test]
    fn other_threads_share_the_coordinator_not_the_handle() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm"));
        let here = get_shared_realm(config.clone()).unwrap();

        let there = std::thread::spawn(move || {
            let realm = get_shared_realm(config).unwrap();
            (realm.id(), Arc::as_ptr(realm.coordinator()) as usize)
        })
        .join()
        .unwrap();

        assert_ne!(here.id(), there.0);
        assert_eq!(Arc::as_ptr(here.coordinator()) as usize, there.1);
    }

    #[test]
    fn incompatible_options_are_rejected() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm")).schema(items(), 1);
        let _open = get_shared_realm(config.clone()).unwrap();

        let cases = [
            config.clone().read_only(true),
            config.clone().in_memory(true),
            config.clone().encryption_key(EncryptionKey::generate()),
            config.clone().schema_version(SchemaVersion::Versioned(2)),
        ];
        for case in cases {
            let err = get_shared_realm(case).unwrap_err();
            assert!(err.is_config_mismatch(), "{err}");
        }

        get_shared_realm(config.schema_version(SchemaVersion::Unversioned)).unwrap();
    }

    #[test]
    fn latest_migration_callback_wins() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm"));
        let realm = get_shared_realm(config.clone().migration(|_, _| Ok(()))).unwrap();
        assert!(realm.coordinator().migration_function().is_some());

        let _again = get_shared_realm(config).unwrap();
        assert!(realm.coordinator().migration_function().is_none());
    }

    #[test]
    fn last_handle_releases_the_coordinator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.realm");
        let realm = get_shared_realm(OpenConfig::new(&path)).unwrap();
        let first = Arc::downgrade(realm.coordinator());
        assert!(registry::resolve_existing(&path).is_some());

        drop(realm);
        assert!(registry::resolve_existing(&path).is_none());
        assert!(first.upgrade().is_none());

        let reopened = get_shared_realm(OpenConfig::new(&path)).unwrap();
        assert_eq!(reopened.coordinator().live_realm_count(), 1);
    }

    #[test]
    fn schema_is_published_while_handles_live() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.realm");
        let realm = get_shared_realm(OpenConfig::new(&path).schema(items(), 3)).unwrap();
        let coordinator = Arc::clone(realm.coordinator());
        assert_eq!(coordinator.schema_version(), Some(SchemaVersion::Versioned(3)));
        assert!(Arc::ptr_eq(&coordinator.schema().unwrap(), &realm.schema().unwrap()));

        let other = get_shared_realm(OpenConfig::new(&path).cache(false)).unwrap();
        assert!(Arc::ptr_eq(&other.schema().unwrap(), &realm.schema().unwrap()));

        drop((realm, other));
        assert!(coordinator.schema().is_none());
        assert!(coordinator.schema_version().is_none());
    }
}
