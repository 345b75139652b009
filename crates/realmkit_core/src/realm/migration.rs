//! Schema updates and migrations for a handle.

use super::Realm;
use crate::error::{CoreError, CoreResult};
use crate::object_store;
use crate::schema::{Schema, SchemaVersion};
use std::sync::Arc;
use tracing::{info, warn};

impl Realm {
    /// Brings the realm to `schema` at `version`.
    ///
    /// When nothing needs to change on disk (the handle is read-only, or
    /// the version is unchanged and the schemas match) the schema is
    /// checked for compatibility and adopted in place. Otherwise a write
    /// transaction reconciles the tables, runs the migration callback with
    /// a read-only view of the data before the change, and commits. On
    /// failure everything is rolled back, including the schema published
    /// on the coordinator.
    ///
    /// Returns true if the file was changed.
    ///
    /// # Errors
    ///
    /// [`CoreError::SchemaValidationFailed`] for a malformed schema,
    /// [`CoreError::SchemaMismatch`] for incompatible changes that cannot
    /// be migrated, [`CoreError::MigrationFailed`] when the callback fails.
    pub fn update_schema(&self, schema: Schema, version: SchemaVersion) -> CoreResult<bool> {
        self.apply_schema(Arc::new(schema), version, true)
    }

    /// `publish` is false while the coordinator is still creating this
    /// handle; it publishes the resulting schema itself.
    pub(super) fn apply_schema(
        &self,
        target: Arc<Schema>,
        version: SchemaVersion,
        publish: bool,
    ) -> CoreResult<bool> {
        self.verify_thread()?;
        target.validate()?;

        let old_schema = self.schema();
        let old_version = self.schema_version();
        let current = old_schema.as_deref().cloned().unwrap_or_default();
        let read_only = self.config.read_only;

        let adopted_version = if version.is_versioned() {
            version
        } else {
            old_version
        };

        let needs_update = !read_only
            && (version != old_version || object_store::needs_update(&current, &target));
        if !needs_update {
            object_store::verify_schema(&current, &target, read_only)?;
            self.with_state(|s| {
                s.schema = Some(Arc::clone(&target));
                s.schema_version = adopted_version;
            });
            if publish {
                self.coordinator.publish_schema(target, adopted_version);
            }
            return Ok(false);
        }

        let previous =
            publish.then(|| self.coordinator.publish_schema(Arc::clone(&target), adopted_version));
        let migration = if publish {
            self.coordinator.migration_function()
        } else {
            self.config.migration.clone()
        };

        let outcome = self.migrate(
            old_schema.clone(),
            old_version,
            &target,
            version,
            adopted_version,
            migration,
        );
        match outcome {
            Ok(changed) => {
                info!(
                    target: "realmkit::migration",
                    path = %self.config.path.display(),
                    from = %old_version,
                    to = %version,
                    changed,
                    "schema updated"
                );
                Ok(changed)
            }
            Err(e) => {
                warn!(
                    target: "realmkit::migration",
                    path = %self.config.path.display(),
                    from = %old_version,
                    to = %version,
                    error = %e,
                    "schema update rolled back"
                );
                if self.is_in_transaction() {
                    if let Err(cancel) = self.cancel_transaction() {
                        warn!(target: "realmkit::migration", error = %cancel, "failed to cancel migration");
                    }
                }
                self.with_state(|s| {
                    s.schema = old_schema;
                    s.schema_version = old_version;
                });
                if let Some(previous) = previous {
                    self.coordinator.restore_schema(previous);
                }
                Err(e)
            }
        }
    }

    fn migrate(
        &self,
        old_schema: Option<Arc<Schema>>,
        old_version: SchemaVersion,
        target: &Arc<Schema>,
        version: SchemaVersion,
        new_version: SchemaVersion,
        migration: Option<crate::config::MigrationFunction>,
    ) -> CoreResult<bool> {
        self.begin_transaction()?;
        let base = self
            .with_state(|s| s.write.as_ref().map(|txn| txn.base().clone()))
            .ok_or_else(|| CoreError::invalid_transaction("migration lost its write transaction"))?;
        let old_view = self.detached_view(base, old_schema, old_version);

        self.with_state(|s| {
            s.schema = Some(Arc::clone(target));
            s.schema_version = new_version;
        });

        let changed = object_store::update_realm_with_schema(
            self,
            version,
            target,
            self.config.delete_if_migration_needed,
            &mut || match &migration {
                Some(callback) => callback(&old_view, self).map_err(|e| match e {
                    CoreError::MigrationFailed { .. } => e,
                    other => CoreError::migration_failed(format!("migration callback failed: {other}")),
                }),
                None => Ok(()),
            },
        )?;

        self.commit_transaction()?;
        Ok(changed)
    }
}
