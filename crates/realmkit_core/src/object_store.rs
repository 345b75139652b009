//! Reconciliation between a target [`Schema`] and the tables of a [`Group`].

use crate::error::{CoreError, CoreResult};
use crate::group::{Group, Value};
use crate::schema::{ObjectSchema, Property, PropertyType, Schema, SchemaVersion};
use std::collections::HashSet;
use std::fmt;

/// One structural difference between two schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// An object type exists only in the target.
    AddTable {
        /// Object type name.
        object_type: String,
    },
    /// A property exists only in the target.
    AddProperty {
        /// Object type name.
        object_type: String,
        /// Property name.
        property: String,
    },
    /// A property exists only in the old schema.
    RemoveProperty {
        /// Object type name.
        object_type: String,
        /// Property name.
        property: String,
    },
    /// A property changed type, link target or nullability.
    ChangePropertyType {
        /// Object type name.
        object_type: String,
        /// Property name.
        property: String,
        /// Old type.
        old: PropertyType,
        /// New type.
        new: PropertyType,
    },
    /// The primary key of an object type changed.
    ChangePrimaryKey {
        /// Object type name.
        object_type: String,
        /// Old primary key property.
        old: Option<String>,
        /// New primary key property.
        new: Option<String>,
    },
    /// A property gained or lost its index.
    ChangeIndex {
        /// Object type name.
        object_type: String,
        /// Property name.
        property: String,
        /// Whether the property is indexed in the target.
        indexed: bool,
    },
}

impl SchemaChange {
    /// Returns true when existing data has to be migrated for this change.
    ///
    /// New object types and index changes apply without a version bump.
    #[must_use]
    pub fn requires_migration(&self) -> bool {
        !matches!(self, Self::AddTable { .. } | Self::ChangeIndex { .. })
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddTable { object_type } => {
                write!(f, "object type '{object_type}' has been added")
            }
            Self::AddProperty {
                object_type,
                property,
            } => write!(f, "property '{object_type}.{property}' has been added"),
            Self::RemoveProperty {
                object_type,
                property,
            } => write!(f, "property '{object_type}.{property}' has been removed"),
            Self::ChangePropertyType {
                object_type,
                property,
                old,
                new,
            } => write!(
                f,
                "property '{object_type}.{property}' has changed from {old} to {new}"
            ),
            Self::ChangePrimaryKey {
                object_type,
                old,
                new,
            } => write!(
                f,
                "primary key of '{object_type}' has changed from {} to {}",
                old.as_deref().unwrap_or("none"),
                new.as_deref().unwrap_or("none")
            ),
            Self::ChangeIndex {
                object_type,
                property,
                indexed,
            } => write!(
                f,
                "property '{object_type}.{property}' has {} an index",
                if *indexed { "gained" } else { "lost" }
            ),
        }
    }
}

/// Write access to the group of an open write transaction.
///
/// Reconciliation runs in several steps with the user's migration callback
/// in between, so it never holds the group across the callback.
pub trait GroupAccess {
    /// Runs `f` against the writable group.
    fn with_group(&self, f: &mut dyn FnMut(&mut Group) -> CoreResult<()>) -> CoreResult<()>;
}

/// Reads the schema described by the tables of `group`.
#[must_use]
pub fn schema_from_group(group: &Group) -> Schema {
    Schema::new(
        group
            .tables()
            .map(|(name, table)| ObjectSchema {
                name: name.to_string(),
                properties: table.columns().to_vec(),
                primary_key: table.primary_key().map(str::to_string),
            })
            .collect(),
    )
}

/// Returns the schema version stored in `group`.
#[must_use]
pub fn get_schema_version(group: &Group) -> SchemaVersion {
    group.schema_version()
}

/// Stamps `version` into `group`.
pub fn set_schema_version(group: &mut Group, version: SchemaVersion) {
    group.set_schema_version(version);
}

/// Lists the changes needed to turn `old` into `new`.
///
/// Object types present only in `old` are kept in the file and are not
/// reported.
#[must_use]
pub fn schema_changes(old: &Schema, new: &Schema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for target in new {
        let Some(existing) = old.find(&target.name) else {
            changes.push(SchemaChange::AddTable {
                object_type: target.name.clone(),
            });
            continue;
        };
        diff_object(existing, target, &mut changes);
    }
    changes
}

fn diff_object(existing: &ObjectSchema, target: &ObjectSchema, changes: &mut Vec<SchemaChange>) {
    let object_type = || target.name.clone();

    for property in &target.properties {
        match existing.property(&property.name) {
            None => changes.push(SchemaChange::AddProperty {
                object_type: object_type(),
                property: property.name.clone(),
            }),
            Some(current) if !current.same_storage(property) => {
                changes.push(SchemaChange::ChangePropertyType {
                    object_type: object_type(),
                    property: property.name.clone(),
                    old: current.property_type,
                    new: property.property_type,
                });
            }
            Some(current) if current.is_indexed != property.is_indexed => {
                changes.push(SchemaChange::ChangeIndex {
                    object_type: object_type(),
                    property: property.name.clone(),
                    indexed: property.is_indexed,
                });
            }
            Some(_) => {}
        }
    }

    for property in &existing.properties {
        if target.property(&property.name).is_none() {
            changes.push(SchemaChange::RemoveProperty {
                object_type: object_type(),
                property: property.name.clone(),
            });
        }
    }

    if existing.primary_key != target.primary_key {
        changes.push(SchemaChange::ChangePrimaryKey {
            object_type: object_type(),
            old: existing.primary_key.clone(),
            new: target.primary_key.clone(),
        });
    }
}

/// Returns true when `old` and `new` differ structurally.
#[must_use]
pub fn needs_update(old: &Schema, new: &Schema) -> bool {
    !schema_changes(old, new).is_empty()
}

/// Checks that data stored under `existing` can be read as `target`.
///
/// Index differences are tolerated. Object types missing from the file are
/// tolerated only when `allow_missing_tables` is set, as for read-only
/// handles which cannot create them.
///
/// # Errors
///
/// Returns [`CoreError::SchemaMismatch`] listing every incompatibility.
pub fn verify_schema(
    existing: &Schema,
    target: &Schema,
    allow_missing_tables: bool,
) -> CoreResult<()> {
    let errors: Vec<String> = schema_changes(existing, target)
        .into_iter()
        .filter(|change| match change {
            SchemaChange::AddTable { .. } => !allow_missing_tables,
            SchemaChange::ChangeIndex { .. } => false,
            _ => true,
        })
        .map(|change| change.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::SchemaMismatch { errors })
    }
}

/// Makes the tables of `group` match `target`.
///
/// Creates missing tables, adds missing columns, drops columns the target
/// no longer has and recreates columns whose storage changed (their values
/// reset to defaults). Returns true if anything changed.
pub fn create_tables(group: &mut Group, target: &Schema) -> CoreResult<bool> {
    let mut changed = false;
    for object_schema in target {
        let Some(table) = group.table(&object_schema.name) else {
            group.add_table(object_schema);
            changed = true;
            continue;
        };

        let mut removed: Vec<String> = Vec::new();
        let mut added: Vec<Property> = Vec::new();
        let mut reindexed: Vec<(String, bool)> = Vec::new();
        for column in table.columns() {
            match object_schema.property(&column.name) {
                None => removed.push(column.name.clone()),
                Some(p) if !p.same_storage(column) => {
                    removed.push(column.name.clone());
                    added.push(p.clone());
                }
                Some(p) if p.is_indexed != column.is_indexed => {
                    reindexed.push((p.name.clone(), p.is_indexed));
                }
                Some(_) => {}
            }
        }
        for property in &object_schema.properties {
            if table.column_index(&property.name).is_none() {
                added.push(property.clone());
            }
        }
        let primary_changed = table.primary_key() != object_schema.primary_key.as_deref();

        if removed.is_empty() && added.is_empty() && reindexed.is_empty() && !primary_changed {
            continue;
        }
        changed = true;

        let table = group.table_mut(&object_schema.name)?;
        for name in &removed {
            table.remove_column(name)?;
        }
        for property in added {
            table.add_column(property);
        }
        for (name, indexed) in &reindexed {
            table.set_indexed(name, *indexed)?;
        }
        if primary_changed {
            table.set_primary_key(object_schema.primary_key.clone());
        }
    }
    Ok(changed)
}

/// Checks that no primary key column of `schema` holds duplicate values.
///
/// # Errors
///
/// Returns [`CoreError::MigrationFailed`] naming the first offending object
/// type.
pub fn validate_primary_keys(group: &Group, schema: &Schema) -> CoreResult<()> {
    for object_schema in schema {
        let (Some(primary), Some(table)) = (
            object_schema.primary_key.as_deref(),
            group.table(&object_schema.name),
        ) else {
            continue;
        };

        let mut seen = HashSet::new();
        for value in table.column_values(primary)? {
            let key = match value {
                Value::Int(v) => v.to_string(),
                Value::String(s) => format!("'{s}'"),
                Value::Null => "null".to_string(),
                other => format!("{other:?}"),
            };
            if !seen.insert(key.clone()) {
                return Err(CoreError::migration_failed(format!(
                    "primary key property '{}.{primary}' has duplicate value {key}",
                    object_schema.name
                )));
            }
        }
    }
    Ok(())
}

/// Brings the realm behind `realm` up to `target` at `version`.
///
/// * An unversioned file is initialized: tables created and version
///   stamped, `migration` not called.
/// * A versioned file moving to a higher version gets its tables updated,
///   then `migration` runs, then primary keys are checked.
/// * A versioned file at the same version may only gain object types or
///   indexes; anything else is a mismatch.
/// * A lower version is rejected.
///
/// With `reset_on_migration`, a file that would need migrating is wiped
/// and recreated instead. Returns true if the file changed.
///
/// # Errors
///
/// [`CoreError::SchemaMismatch`] for version downgrades or changes without
/// a version bump, and whatever `migration` returns.
pub fn update_realm_with_schema(
    realm: &dyn GroupAccess,
    version: SchemaVersion,
    target: &Schema,
    reset_on_migration: bool,
    migration: &mut dyn FnMut() -> CoreResult<()>,
) -> CoreResult<bool> {
    let mut old_version = SchemaVersion::Unversioned;
    let mut changes = Vec::new();
    realm.with_group(&mut |group| {
        old_version = get_schema_version(group);
        changes = schema_changes(&schema_from_group(group), target);
        Ok(())
    })?;

    if let (SchemaVersion::Versioned(new), SchemaVersion::Versioned(old)) = (version, old_version)
    {
        if new < old {
            return Err(CoreError::SchemaMismatch {
                errors: vec![format!(
                    "provided schema version {new} is less than last set version {old}"
                )],
            });
        }
    }

    let version_bump = old_version.is_versioned() && version.is_versioned() && version != old_version;
    let structural = changes.iter().any(SchemaChange::requires_migration);
    let needs_migration = old_version.is_versioned() && (version_bump || structural);

    if needs_migration && reset_on_migration {
        realm.with_group(&mut |group| {
            group.clear();
            create_tables(group, target)?;
            set_schema_version(group, version);
            Ok(())
        })?;
        return Ok(true);
    }

    if needs_migration && !version_bump {
        let mut errors: Vec<String> = changes
            .iter()
            .filter(|c| c.requires_migration())
            .map(ToString::to_string)
            .collect();
        errors.push(format!(
            "migration is required but schema version is still {old_version}"
        ));
        return Err(CoreError::SchemaMismatch { errors });
    }

    let mut changed = false;
    realm.with_group(&mut |group| {
        changed = create_tables(group, target)?;
        Ok(())
    })?;

    if version_bump {
        migration()?;
        realm.with_group(&mut |group| validate_primary_keys(group, target))?;
    }

    realm.with_group(&mut |group| {
        if version.is_versioned() && group.schema_version() != version {
            set_schema_version(group, version);
            changed = true;
        }
        Ok(())
    })?;

    Ok(changed)
}
