//! Coordinator caching, compatibility checks and reaping.

use realmkit_core::registry;
use realmkit_core::{
    get_shared_realm, CoreError, EncryptionKey, ObjectSchema, OpenConfig, Property, PropertyType,
    Schema, SchemaVersion,
};
use realmkit_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn same_thread_with_cache_gets_the_same_handle() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("cache").schema(person_schema_v1(), 1);

    let a = get_shared_realm(config.clone()).unwrap();
    let b = get_shared_realm(config).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.coordinator().live_realm_count(), 1);
}

#[test]
fn other_threads_get_their_own_handle_on_one_coordinator() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("threads").schema(person_schema_v1(), 1);
    let main = get_shared_realm(config.clone()).unwrap();

    let (other_id, other_coordinator) = thread::spawn(move || {
        let realm = get_shared_realm(config).unwrap();
        (realm.id(), Arc::clone(realm.coordinator()))
    })
    .join()
    .unwrap();

    assert_ne!(main.id(), other_id);
    assert!(Arc::ptr_eq(main.coordinator(), &other_coordinator));
}

#[test]
fn uncached_opens_are_always_fresh() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("fresh").schema(person_schema_v1(), 1).cache(false);

    let a = get_shared_realm(config.clone()).unwrap();
    let b = get_shared_realm(config.clone()).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));

    // A cached open never hands out an uncached handle either.
    let c = get_shared_realm(config.cache(true)).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert!(!Arc::ptr_eq(&b, &c));
    assert_eq!(a.coordinator().live_realm_count(), 3);
}

#[test]
fn read_only_flip_is_a_config_mismatch() {
    init_tracing();
    let dir = TestRealmDir::new();
    let _realm = get_shared_realm(dir.config("ro").schema(person_schema_v1(), 1)).unwrap();

    let err = get_shared_realm(dir.config("ro").read_only(true)).unwrap_err();
    assert!(err.is_config_mismatch());
    assert!(err.to_string().contains("different read permissions"));
}

#[test]
fn in_memory_flip_is_a_config_mismatch() {
    init_tracing();
    let dir = TestRealmDir::new();
    let _realm = get_shared_realm(dir.config("mem")).unwrap();

    let err = get_shared_realm(dir.config("mem").in_memory(true)).unwrap_err();
    assert!(err.to_string().contains("different in-memory settings"));
}

#[test]
fn different_key_is_a_config_mismatch() {
    init_tracing();
    let dir = TestRealmDir::new();
    let key = EncryptionKey::generate();
    let _realm = get_shared_realm(dir.config("key").encryption_key(key.clone())).unwrap();

    let err = get_shared_realm(dir.config("key")).unwrap_err();
    assert!(err.to_string().contains("different encryption key"));

    let err = get_shared_realm(dir.config("key").encryption_key(EncryptionKey::generate()))
        .unwrap_err();
    assert!(err.is_config_mismatch());

    assert!(get_shared_realm(dir.config("key").encryption_key(key)).is_ok());
}

#[test]
fn schema_version_must_match_unless_unversioned() {
    init_tracing();
    let dir = TestRealmDir::new();
    let realm = get_shared_realm(dir.config("ver").schema(person_schema_v1(), 1)).unwrap();

    let err = get_shared_realm(dir.config("ver").schema(person_schema_v2(), 2)).unwrap_err();
    assert!(matches!(err, CoreError::ConfigMismatch { .. }));
    assert!(err.to_string().contains("different schema version"));

    // Unversioned requests take whatever is canonical, schema included.
    let unversioned = get_shared_realm(dir.config("ver").cache(false)).unwrap();
    assert_eq!(unversioned.schema_version(), SchemaVersion::Versioned(1));
    assert!(Arc::ptr_eq(
        &unversioned.schema().unwrap(),
        &realm.schema().unwrap()
    ));
}

#[test]
fn last_handle_closing_releases_the_coordinator() {
    init_tracing();
    let dir = TestRealmDir::new();
    let path = dir.path("reap");
    let config = dir.config("reap").schema(person_schema_v1(), 1);

    let realm = get_shared_realm(config.clone()).unwrap();
    let first = Arc::downgrade(realm.coordinator());
    assert!(registry::resolve_existing(&path).is_some());

    drop(realm);
    assert!(registry::resolve_existing(&path).is_none());
    assert!(first.upgrade().is_none());

    let realm = get_shared_realm(config).unwrap();
    assert!(registry::resolve_existing(&path).is_some());
    assert_eq!(realm.schema_version(), SchemaVersion::Versioned(1));
}

#[test]
fn uncached_handles_keep_the_coordinator_alive() {
    init_tracing();
    let dir = TestRealmDir::new();
    let path = dir.path("alive");
    let config = dir.config("alive").schema(person_schema_v1(), 1);

    let cached = get_shared_realm(config.clone()).unwrap();
    let uncached = get_shared_realm(config.cache(false)).unwrap();
    drop(cached);

    let coordinator = registry::resolve_existing(&path).unwrap();
    assert_eq!(coordinator.live_realm_count(), 1);
    assert_eq!(coordinator.schema_version(), Some(SchemaVersion::Versioned(1)));
    drop(coordinator);

    drop(uncached);
    assert!(registry::resolve_existing(&path).is_none());
}

#[test]
fn canonical_schema_is_only_reported_while_live() {
    init_tracing();
    let dir = TestRealmDir::new();
    let realm = get_shared_realm(dir.config("live").schema(person_schema_v1(), 3)).unwrap();
    let coordinator = Arc::clone(realm.coordinator());

    assert_eq!(coordinator.schema().as_deref(), Some(&person_schema_v1()));
    assert_eq!(coordinator.schema_version(), Some(SchemaVersion::Versioned(3)));

    drop(realm);
    assert!(coordinator.schema().is_none());
    assert!(coordinator.schema_version().is_none());
}

#[test]
fn latest_migration_callback_wins() {
    init_tracing();
    let dir = TestRealmDir::new();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first_calls);
    let realm = get_shared_realm(dir.config("lww").schema(person_schema_v1(), 1).migration(
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ))
    .unwrap();

    let counter = Arc::clone(&second_calls);
    let _again = get_shared_realm(dir.config("lww").migration(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }))
    .unwrap();

    let callback = realm.coordinator().migration_function().unwrap();
    callback(&*realm, &*realm).unwrap();
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn normalized_paths_share_a_coordinator() {
    init_tracing();
    let dir = TestRealmDir::new();
    let plain = dir.path("norm");
    let dotted = plain
        .parent()
        .unwrap()
        .join(".")
        .join(plain.file_name().unwrap());

    let a = get_shared_realm(OpenConfig::new(&plain)).unwrap();
    let b = get_shared_realm(OpenConfig::new(&dotted)).unwrap();
    assert!(Arc::ptr_eq(a.coordinator(), b.coordinator()));
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn concurrent_first_opens_agree_on_one_coordinator() {
    init_tracing();
    let dir = TestRealmDir::new();
    for round in 0..5 {
        let config = dir.config(&format!("race-{round}")).schema(person_schema_v1(), 1);
        assert_eq!(stress_concurrent_opens(&config, 8), 1);
    }
    let config = in_memory_config("race").schema(person_schema_v1(), 1);
    assert_eq!(stress_concurrent_opens(&config, 8), 1);
}

#[test]
fn open_racing_the_last_close_stays_on_the_registered_coordinator() {
    init_tracing();
    let config = in_memory_config("reclaim").schema(person_schema_v1(), 1);
    let first = get_shared_realm(config.clone()).unwrap();
    let coordinator = registry::resolve_or_create(&config.path).unwrap();

    // The last handle goes away after the coordinator was resolved.
    drop(first);
    assert!(registry::resolve_existing(&config.path).is_none());

    let writer = coordinator.get_realm(config.clone().cache(false)).unwrap();
    assert!(Arc::ptr_eq(
        &registry::resolve_existing(&config.path).unwrap(),
        &coordinator
    ));
    populate_people(&writer, 2).unwrap();

    let reader = get_shared_realm(config).unwrap();
    assert!(Arc::ptr_eq(reader.coordinator(), &coordinator));
    assert_eq!(person_count(&reader).unwrap(), 2);
}

#[test]
fn failed_first_open_can_be_retried_with_a_corrected_config() {
    init_tracing();
    let dir = TestRealmDir::new();
    let coordinator = registry::resolve_or_create(&dir.path("retry")).unwrap();
    let duplicated = Schema::new(vec![
        ObjectSchema::new("Person", vec![Property::new("id", PropertyType::Int)]),
        ObjectSchema::new("Person", vec![Property::new("id", PropertyType::Int)]),
    ]);

    let err = coordinator
        .get_realm(dir.config("retry").schema(duplicated, 5))
        .unwrap_err();
    assert!(matches!(err, CoreError::SchemaValidationFailed { .. }), "{err}");
    assert!(coordinator.session().is_none());
    assert_eq!(coordinator.live_realm_count(), 0);

    let realm = coordinator
        .get_realm(dir.config("retry").schema(person_schema_v1(), 1))
        .unwrap();
    assert_eq!(realm.schema_version(), SchemaVersion::Versioned(1));
    assert_eq!(coordinator.schema_version(), Some(SchemaVersion::Versioned(1)));

    // Once a handle exists, the corrected config is the canonical one.
    let err = get_shared_realm(dir.config("retry").schema(person_schema_v1(), 5)).unwrap_err();
    assert!(err.is_config_mismatch());
}
