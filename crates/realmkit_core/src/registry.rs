//! Process-wide map from realm path to its coordinator.
//!
//! The map holds weak references only. A coordinator lives as long as one
//! of its handles does; the last handle to go removes the entry (see
//! `RealmCoordinator::unregister_realm`). Lock order is registry first,
//! then coordinator.

use crate::coordinator::RealmCoordinator;
use crate::error::{CoreError, CoreResult, FileAccessKind};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

type CoordinatorMap = BTreeMap<PathBuf, Weak<RealmCoordinator>>;

static COORDINATORS: Mutex<CoordinatorMap> = parking_lot::const_mutex(BTreeMap::new());

pub(crate) fn lock() -> MutexGuard<'static, CoordinatorMap> {
    COORDINATORS.lock()
}

/// Turns `path` into the registry key: absolute, with the parent directory
/// canonicalized when it exists.
///
/// # Errors
///
/// Fails when the current directory is needed and unavailable.
pub fn normalize_path(path: &Path) -> CoreResult<PathBuf> {
    let absolute = std::path::absolute(path)
        .map_err(|e| CoreError::file_access(FileAccessKind::AccessError, path, e.to_string()))?;
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => Ok(std::fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or(absolute.clone())),
        _ => Ok(absolute),
    }
}

/// Returns the live coordinator for `path`, creating one if needed.
///
/// Concurrent callers for one path all get the same coordinator.
pub fn resolve_or_create(path: &Path) -> CoreResult<Arc<RealmCoordinator>> {
    let key = normalize_path(path)?;
    let mut map = lock();
    if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
        debug!(target: "realmkit::registry", path = %key.display(), "coordinator reused");
        return Ok(existing);
    }

    let coordinator = Arc::new(RealmCoordinator::new(key.clone()));
    map.insert(key.clone(), Arc::downgrade(&coordinator));
    info!(target: "realmkit::registry", path = %key.display(), "coordinator created");
    Ok(coordinator)
}

/// Returns the live coordinator for `path`, if any.
pub fn resolve_existing(path: &Path) -> Option<Arc<RealmCoordinator>> {
    let key = normalize_path(path).ok()?;
    lock().get(&key).and_then(Weak::upgrade)
}

/// Forgets every coordinator, live or not.
///
/// Existing handles keep working against their old coordinator; the next
/// open of any path starts a new one.
pub fn clear_all() {
    let cleared = {
        let mut map = lock();
        let count = map.len();
        map.clear();
        count
    };
    info!(target: "realmkit::registry", cleared, "coordinator cache cleared");
}

/// Points `path` back at `coordinator` when its entry is missing or dead.
///
/// Returns the coordinator currently registered for `path` when that is a
/// different live one.
pub(crate) fn claim(
    map: &mut CoordinatorMap,
    path: &Path,
    coordinator: &Arc<RealmCoordinator>,
) -> Option<Arc<RealmCoordinator>> {
    match map.get(path).and_then(Weak::upgrade) {
        Some(current) if !Arc::ptr_eq(&current, coordinator) => Some(current),
        Some(_) => None,
        None => {
            map.insert(path.to_path_buf(), Arc::downgrade(coordinator));
            debug!(target: "realmkit::registry", path = %path.display(), "coordinator registered again");
            None
        }
    }
}

/// Removes `path` if it still maps to `coordinator`.
pub(crate) fn remove_if_current(
    map: &mut CoordinatorMap,
    path: &Path,
    coordinator: &RealmCoordinator,
) -> bool {
    let current = map
        .get(path)
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), coordinator));
    if current {
        map.remove(path);
    }
    current
}
