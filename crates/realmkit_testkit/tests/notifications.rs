//! Commit fan-out and delegate callbacks.

use realmkit_core::{get_shared_realm, OpenConfig};
use realmkit_testkit::prelude::*;
use std::thread;
use std::time::Duration;

fn commit_from_another_thread(config: &OpenConfig, people: i64) {
    let config = config.clone();
    thread::spawn(move || {
        let writer = get_shared_realm(config).unwrap();
        populate_people(&writer, people).unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn notify_reports_availability_before_advancing() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("notify").schema(person_schema_v1(), 1);
    let realm = get_shared_realm(config.clone()).unwrap();
    let recorder = RecordingDelegate::shared();
    realm.set_delegate(Some(recorder.clone())).unwrap();
    realm.ensure_read().unwrap();

    commit_from_another_thread(&config, 2);
    assert!(realm.wait_for_change(Duration::from_secs(5)).unwrap());

    let events = recorder.take();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], DelegateEvent::ChangesAvailable);
    let DelegateEvent::DidChange { from, to, changed } = &events[1] else {
        panic!("expected did_change, got {:?}", events[1]);
    };
    assert!(to > from);
    assert_eq!(changed, &["Person".to_string()]);
    assert_eq!(person_count(&realm).unwrap(), 2);

    // Nothing new: no callbacks at all.
    realm.notify().unwrap();
    assert!(recorder.is_empty());
}

#[test]
fn notify_advances_once_per_call() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("once").schema(person_schema_v1(), 1);
    let realm = get_shared_realm(config.clone()).unwrap();
    let recorder = RecordingDelegate::shared();
    realm.set_delegate(Some(recorder.clone())).unwrap();
    realm.ensure_read().unwrap();

    commit_from_another_thread(&config, 1);
    commit_from_another_thread(&config, 1);
    realm.notify().unwrap();
    realm.notify().unwrap();

    let did_change = recorder
        .take()
        .into_iter()
        .filter(|e| matches!(e, DelegateEvent::DidChange { .. }))
        .count();
    assert_eq!(did_change, 1);
    assert_eq!(person_count(&realm).unwrap(), 2);
}

#[test]
fn without_auto_refresh_only_availability_is_reported() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("manual").schema(person_schema_v1(), 1);
    let realm = get_shared_realm(config.clone()).unwrap();
    let recorder = RecordingDelegate::shared();
    realm.set_delegate(Some(recorder.clone())).unwrap();
    realm.set_auto_refresh(false).unwrap();
    realm.ensure_read().unwrap();

    commit_from_another_thread(&config, 1);
    realm.notify().unwrap();

    assert_eq!(recorder.take(), [DelegateEvent::ChangesAvailable]);
    assert_eq!(person_count(&realm).unwrap(), 0);
    assert!(realm.refresh().unwrap());
    assert_eq!(person_count(&realm).unwrap(), 1);
}

#[test]
fn closed_handles_get_an_empty_change_set() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("closed").schema(person_schema_v1(), 1);
    let realm = get_shared_realm(config.clone()).unwrap();
    let recorder = RecordingDelegate::shared();
    realm.set_delegate(Some(recorder.clone())).unwrap();
    realm.invalidate().unwrap();

    commit_from_another_thread(&config, 1);
    realm.notify().unwrap();

    let events = recorder.take();
    assert_eq!(events[0], DelegateEvent::ChangesAvailable);
    assert!(matches!(
        &events[1],
        DelegateEvent::DidChange { changed, .. } if changed.is_empty()
    ));
    assert_eq!(realm.state(), realmkit_core::TransactionState::Closed);
}

#[test]
fn commits_notify_every_other_handle_but_not_the_committer() {
    init_tracing();
    let dir = TestRealmDir::new();
    let config = dir.config("fanout").schema(person_schema_v1(), 1);
    let a = get_shared_realm(config.clone()).unwrap();
    let b = get_shared_realm(config.clone().cache(false)).unwrap();
    a.pending_commit_notices().unwrap();
    b.pending_commit_notices().unwrap();

    populate_people(&a, 1).unwrap();
    populate_people(&a, 1).unwrap();
    assert_eq!(a.pending_commit_notices().unwrap(), 0);
    assert_eq!(b.pending_commit_notices().unwrap(), 2);
    assert_eq!(b.pending_commit_notices().unwrap(), 0);

    commit_from_another_thread(&config, 1);
    assert_eq!(a.pending_commit_notices().unwrap(), 1);
    assert_eq!(b.pending_commit_notices().unwrap(), 1);
}

#[test]
fn wait_for_change_times_out_quietly() {
    init_tracing();
    let dir = TestRealmDir::new();
    let realm = get_shared_realm(dir.config("quiet").schema(person_schema_v1(), 1)).unwrap();
    realm.pending_commit_notices().unwrap();
    assert!(!realm.wait_for_change(Duration::from_millis(20)).unwrap());
}

#[test]
fn in_memory_realms_fan_out_and_vanish_with_their_last_handle() {
    init_tracing();
    let config = in_memory_config("fanout").schema(person_schema_v1(), 1);
    let realm = get_shared_realm(config.clone()).unwrap();
    realm.ensure_read().unwrap();

    commit_from_another_thread(&config, 3);
    assert!(realm.wait_for_change(Duration::from_secs(5)).unwrap());
    assert_eq!(person_count(&realm).unwrap(), 3);
    assert!(!config.path.exists());
    drop(realm);

    let realm = get_shared_realm(config).unwrap();
    assert_eq!(person_count(&realm).unwrap(), 0);
}
