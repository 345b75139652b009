//! # realmkit core
//!
//! Session and coordination layer for realm files.
//!
//! This crate provides:
//! - a process-wide registry with one [`RealmCoordinator`] per realm path
//! - thread-confined [`Realm`] handles with a Closed / Reading / Writing
//!   transaction state machine
//! - schema validation, reconciliation and user migrations
//! - commit notifications across handles, threads and processes
//! - the storage session the handles run on: an append-only commit log
//!   with snapshot reads, one writer at a time and optional encryption
//!
//! ## Example
//!
//! ```rust,no_run
//! use realmkit_core::{get_shared_realm, ObjectSchema, OpenConfig, Property, PropertyType, Schema, Value};
//!
//! let schema = Schema::new(vec![ObjectSchema::new(
//!     "Person",
//!     vec![Property::new("id", PropertyType::Int)],
//! )]);
//! let realm = get_shared_realm(OpenConfig::new("people.realm").schema(schema, 1))?;
//! realm.transaction(|group| {
//!     group.table_mut("Person")?.insert(&[("id", Value::Int(1))])
//! })?;
//! # Ok::<(), realmkit_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod crypto;
mod delegate;
mod error;
mod group;
mod notifier;
pub mod object_store;
mod realm;
pub mod registry;
mod schema;
mod session;

pub use config::{MigrationFunction, OpenConfig};
pub use coordinator::RealmCoordinator;
pub use crypto::{CryptoManager, EncryptionKey, KEY_SIZE};
pub use delegate::RealmDelegate;
pub use error::{CoreError, CoreResult, FileAccessKind};
pub use group::{Group, Table, Value};
pub use notifier::{CommitNotice, Notifier};
pub use realm::{HandleId, Realm, SharedRealm, TransactionState};
pub use schema::{ObjectSchema, Property, PropertyType, Schema, SchemaVersion};
pub use session::{ChangeSet, SessionOptions, Snapshot, StorageSession, WriteTransaction};

/// Opens a realm handle for `config`.
///
/// Resolves the coordinator for the config's path, creating it on first
/// use, and asks it for a handle.
///
/// # Errors
///
/// See [`RealmCoordinator::get_realm`].
pub fn get_shared_realm(config: OpenConfig) -> CoreResult<SharedRealm> {
    registry::resolve_or_create(&config.path)?.get_realm(config)
}

/// Returns the schema version stored at `config.path`.
///
/// Answers from the live coordinator when the realm is open, otherwise
/// reads the file without keeping it open. A missing file or an in-memory
/// realm nobody has open is unversioned.
///
/// # Errors
///
/// Session open failures such as a wrong encryption key.
pub fn get_schema_version(config: &OpenConfig) -> CoreResult<SchemaVersion> {
    if let Some(version) =
        registry::resolve_existing(&config.path).and_then(|c| c.schema_version())
    {
        return Ok(version);
    }
    if config.in_memory || !config.path.exists() {
        return Ok(SchemaVersion::Unversioned);
    }

    let options = SessionOptions {
        read_only: true,
        ..SessionOptions::from(config)
    };
    let session = StorageSession::open(&config.path, &options)?;
    let snapshot = session.begin_read()?;
    let version = snapshot.group().schema_version();
    session.end_read(snapshot);
    Ok(version)
}

/// Forgets every cached coordinator.
///
/// Open handles keep working; the next open of any path gets a fresh
/// coordinator and session. Meant for tests.
pub fn clear_cache() {
    registry::clear_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn people() -> Schema {
        Schema::new(vec![ObjectSchema::new(
            "Person",
            vec![Property::new("id", PropertyType::Int)],
        )])
    }

    #[test]
    fn schema_version_of_open_and_closed_realms() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm"));
        assert_eq!(
            get_schema_version(&config).unwrap(),
            SchemaVersion::Unversioned
        );

        let realm = get_shared_realm(config.clone().schema(people(), 4)).unwrap();
        assert_eq!(
            get_schema_version(&config).unwrap(),
            SchemaVersion::Versioned(4)
        );

        drop(realm);
        assert_eq!(
            get_schema_version(&config).unwrap(),
            SchemaVersion::Versioned(4)
        );
    }

    #[test]
    fn data_survives_reopening() {
        let dir = tempdir().unwrap();
        let config = OpenConfig::new(dir.path().join("a.realm")).schema(people(), 1);
        let realm = get_shared_realm(config.clone()).unwrap();
        realm
            .transaction(|g| g.table_mut("Person")?.insert(&[("id", Value::Int(9))]))
            .unwrap();
        drop(realm);

        let realm = get_shared_realm(config).unwrap();
        let id = realm
            .read(|g| g.table("Person").unwrap().get(0, "id").unwrap().as_int())
            .unwrap();
        assert_eq!(id, Some(9));
    }
}
