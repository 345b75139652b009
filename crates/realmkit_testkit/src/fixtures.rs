//! Test fixtures: temporary realm directories and sample schemas.

use realmkit_core::{
    get_shared_realm, CoreResult, ObjectSchema, OpenConfig, Property, PropertyType, Schema,
    SharedRealm, Value,
};
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

/// A temporary directory for realm files, removed on drop.
///
/// Every realm opened through it gets a path unique to this directory, so
/// tests sharing the process-wide coordinator registry don't collide.
pub struct TestRealmDir {
    dir: TempDir,
}

impl TestRealmDir {
    /// Creates a new temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Returns the path of `<name>.realm` inside the directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.realm"))
    }

    /// Returns a default config for `<name>.realm`.
    pub fn config(&self, name: &str) -> OpenConfig {
        OpenConfig::new(self.path(name))
    }

    /// Opens a handle for `config`.
    pub fn open(&self, config: OpenConfig) -> CoreResult<SharedRealm> {
        get_shared_realm(config)
    }
}

impl Default for TestRealmDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A unique in-memory config, named after `label` plus a random suffix.
pub fn in_memory_config(label: &str) -> OpenConfig {
    OpenConfig::in_memory_named(&format!("{label}-{}", Uuid::new_v4().simple()))
}

/// `Person { id: int }`.
pub fn person_schema_v1() -> Schema {
    Schema::new(vec![ObjectSchema::new(
        "Person",
        vec![Property::new("id", PropertyType::Int)],
    )])
}

/// `Person { id: int, name: string }`.
pub fn person_schema_v2() -> Schema {
    Schema::new(vec![ObjectSchema::new(
        "Person",
        vec![
            Property::new("id", PropertyType::Int),
            Property::new("name", PropertyType::String),
        ],
    )])
}

/// A `Person`/`Dog` schema with a primary key, an index and links both ways.
pub fn kennel_schema() -> Schema {
    Schema::new(vec![
        ObjectSchema::new(
            "Person",
            vec![
                Property::new("id", PropertyType::Int).indexed(),
                Property::new("name", PropertyType::String),
                Property::list("dogs", "Dog"),
            ],
        )
        .with_primary_key("id"),
        ObjectSchema::new(
            "Dog",
            vec![
                Property::new("name", PropertyType::String),
                Property::link("owner", "Person"),
            ],
        ),
    ])
}

/// Inserts `Person` rows with ids `0..count` in one transaction.
pub fn populate_people(realm: &SharedRealm, count: i64) -> CoreResult<()> {
    realm.transaction(|group| {
        let people = group.table_mut("Person")?;
        for id in 0..count {
            people.insert(&[("id", Value::Int(id))])?;
        }
        Ok(())
    })
}

/// Number of `Person` rows visible to `realm`.
pub fn person_count(realm: &SharedRealm) -> CoreResult<usize> {
    realm.read(|group| group.table("Person").map_or(0, |t| t.row_count()))
}
