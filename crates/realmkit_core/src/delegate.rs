//! Change callbacks for a realm handle.

use crate::session::ChangeSet;

/// Receives change notifications on the thread that owns the handle.
///
/// Both hooks run from [`Realm::notify`](crate::Realm::notify) and
/// [`Realm::refresh`](crate::Realm::refresh). Implementations may call back
/// into the handle.
pub trait RealmDelegate: Send + Sync {
    /// Another handle or process committed. Runs before any refresh.
    fn changes_available(&self) {}

    /// The handle moved to a newer commit. `changes` is empty when the
    /// handle had no open snapshot to compare against.
    fn did_change(&self, changes: &ChangeSet) {
        let _ = changes;
    }
}
