//! Realm open configuration.

use crate::crypto::EncryptionKey;
use crate::error::CoreResult;
use crate::realm::Realm;
use crate::schema::{Schema, SchemaVersion};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// User callback run when a schema version change requires migrating data.
///
/// Called with a read-only view of the file before the change and the
/// handle performing the migration, which is inside a write transaction.
pub type MigrationFunction = Arc<dyn Fn(&Realm, &Realm) -> CoreResult<()> + Send + Sync>;

/// Options for opening a realm.
///
/// The first open of a path makes its config canonical for every later
/// open of the same path, until all handles are closed.
#[derive(Clone)]
pub struct OpenConfig {
    /// Path of the realm file. Identity key of the coordinator.
    pub path: PathBuf,

    /// Open without write access.
    pub read_only: bool,

    /// Keep all data in memory; nothing is written to `path`.
    pub in_memory: bool,

    /// Reuse an existing handle of the calling thread.
    pub cache: bool,

    /// Key for encryption at rest.
    pub encryption_key: Option<EncryptionKey>,

    /// Target schema version.
    pub schema_version: SchemaVersion,

    /// Target schema. `None` accepts whatever is stored in the file.
    pub schema: Option<Arc<Schema>>,

    /// Migration callback, used only when `schema` is set and differs.
    pub migration: Option<MigrationFunction>,

    /// Reset the file instead of migrating when the schema needs an update.
    pub delete_if_migration_needed: bool,

    /// Whether to fsync every commit.
    pub sync_on_commit: bool,

    /// How often to poll for commits made by other processes.
    pub notify_poll_interval: Duration,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            read_only: false,
            in_memory: false,
            cache: true,
            encryption_key: None,
            schema_version: SchemaVersion::Unversioned,
            schema: None,
            migration: None,
            delete_if_migration_needed: false,
            sync_on_commit: true,
            notify_poll_interval: Duration::from_millis(50),
        }
    }
}

impl fmt::Debug for OpenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenConfig")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            .field("cache", &self.cache)
            .field("encrypted", &self.encryption_key.is_some())
            .field("schema_version", &self.schema_version)
            .field("schema_types", &self.schema.as_ref().map(|s| s.len()))
            .field("has_migration", &self.migration.is_some())
            .field("delete_if_migration_needed", &self.delete_if_migration_needed)
            .finish_non_exhaustive()
    }
}

impl OpenConfig {
    /// Creates a configuration for the realm at `path` with default options.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Creates an in-memory configuration identified by `identifier`.
    ///
    /// All opens with the same identifier share one realm for as long as a
    /// handle to it is alive.
    #[must_use]
    pub fn in_memory_named(identifier: &str) -> Self {
        let path = std::env::temp_dir().join(format!("realmkit-memory-{identifier}.realm"));
        Self::new(path).in_memory(true)
    }

    /// Returns the realm path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets in-memory mode.
    #[must_use]
    pub fn in_memory(mut self, value: bool) -> Self {
        self.in_memory = value;
        self
    }

    /// Sets whether the handle may be served from the per-thread cache.
    #[must_use]
    pub fn cache(mut self, value: bool) -> Self {
        self.cache = value;
        self
    }

    /// Sets the encryption key.
    #[must_use]
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Sets the target schema and its version.
    #[must_use]
    pub fn schema(mut self, schema: Schema, version: u64) -> Self {
        self.schema = Some(Arc::new(schema));
        self.schema_version = SchemaVersion::Versioned(version);
        self
    }

    /// Sets the target schema version without a schema.
    #[must_use]
    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the migration callback.
    #[must_use]
    pub fn migration<F>(mut self, migration: F) -> Self
    where
        F: Fn(&Realm, &Realm) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(migration));
        self
    }

    /// Sets whether to reset the file instead of migrating.
    #[must_use]
    pub fn delete_if_migration_needed(mut self, value: bool) -> Self {
        self.delete_if_migration_needed = value;
        self
    }

    /// Sets whether to fsync every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the cross-process commit poll interval.
    #[must_use]
    pub fn notify_poll_interval(mut self, interval: Duration) -> Self {
        self.notify_poll_interval = interval;
        self
    }
}
