//! A delegate that records what it was told.

use parking_lot::Mutex;
use realmkit_core::{ChangeSet, RealmDelegate};
use std::sync::Arc;

/// One delegate callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    /// `changes_available` ran.
    ChangesAvailable,
    /// `did_change` ran with these changed object types.
    DidChange {
        /// Version the handle moved from.
        from: u64,
        /// Version the handle moved to.
        to: u64,
        /// Names of changed object types.
        changed: Vec<String>,
    },
}

/// Records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingDelegate {
    /// Creates a shared recorder, ready for `Realm::set_delegate`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes the recorded events.
    pub fn take(&self) -> Vec<DelegateEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl RealmDelegate for RecordingDelegate {
    fn changes_available(&self) {
        self.events.lock().push(DelegateEvent::ChangesAvailable);
    }

    fn did_change(&self, changes: &ChangeSet) {
        self.events.lock().push(DelegateEvent::DidChange {
            from: changes.from_version,
            to: changes.to_version,
            changed: changes.changed_types.clone(),
        });
    }
}
