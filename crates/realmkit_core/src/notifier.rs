//! Commit fan-out to the handles of one coordinator.
//!
//! Local handles subscribe with [`Notifier::add_realm`] and receive a
//! [`CommitNotice`] on their channel whenever another handle commits.
//! For file-backed realms commits are also signalled to other processes
//! by appending to `<path>.note`; a watcher thread polls that file and fans
//! out what other processes committed.

use crate::error::CoreResult;
use crate::realm::HandleId;
use crate::session::sidecar_path;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// The note file is reset once it grows past this many bytes.
const NOTE_FILE_LIMIT: u64 = 4096;

/// "Something committed" event delivered to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitNotice {
    /// The committing handle, or `None` for a commit by another process.
    pub source: Option<HandleId>,
}

struct NoteFile {
    file: Mutex<(File, u64)>,
    writable: bool,
}

impl NoteFile {
    fn open(realm_path: &Path) -> Option<Self> {
        let path = sidecar_path(realm_path, "note");
        let (file, writable) = match OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) => match File::open(&path) {
                Ok(file) => (file, false),
                Err(_) => {
                    warn!(
                        target: "realmkit::notifier",
                        path = %path.display(),
                        error = %e,
                        "no cross-process notifications for this realm"
                    );
                    return None;
                }
            },
        };
        let seen = file.metadata().map(|m| m.len()).unwrap_or(0);
        Some(Self {
            file: Mutex::new((file, seen)),
            writable,
        })
    }

    fn signal(&self) {
        if !self.writable {
            return;
        }
        let mut guard = self.file.lock();
        let (file, seen) = &mut *guard;
        let result = (|| {
            if file.metadata()?.len() >= NOTE_FILE_LIMIT {
                file.set_len(0)?;
            }
            file.write_all(&[1])?;
            file.metadata().map(|m| m.len())
        })();
        match result {
            Ok(len) => *seen = len,
            Err(e) => warn!(target: "realmkit::notifier", error = %e, "failed to signal commit"),
        }
    }

    /// Returns true if another process signalled since the last check.
    fn poll(&self) -> bool {
        let mut guard = self.file.lock();
        let (file, seen) = &mut *guard;
        match file.metadata() {
            Ok(meta) if meta.len() != *seen => {
                *seen = meta.len();
                true
            }
            _ => false,
        }
    }
}

/// Delivers commit notices for one realm path.
pub struct Notifier {
    path: PathBuf,
    subscribers: RwLock<Vec<(HandleId, Sender<CommitNotice>)>>,
    note: Option<NoteFile>,
}

impl Notifier {
    /// Creates the notifier for `path`.
    ///
    /// File-backed realms also get a watcher thread polling for other
    /// processes' commits every `poll_interval`; it stops on its own once
    /// the notifier is dropped.
    ///
    /// # Errors
    ///
    /// Fails if the watcher thread cannot be spawned.
    pub fn start(path: &Path, in_memory: bool, poll_interval: Duration) -> CoreResult<Arc<Self>> {
        let notifier = Arc::new(Self {
            path: path.to_path_buf(),
            subscribers: RwLock::new(Vec::new()),
            note: if in_memory { None } else { NoteFile::open(path) },
        });

        if notifier.note.is_some() {
            let weak: Weak<Self> = Arc::downgrade(&notifier);
            thread::Builder::new()
                .name("realmkit-notifier".into())
                .spawn(move || loop {
                    thread::sleep(poll_interval);
                    let Some(notifier) = weak.upgrade() else {
                        break;
                    };
                    notifier.poll_external();
                })?;
        }
        Ok(notifier)
    }

    /// Subscribes a handle. Its receiver gets every later notice not caused
    /// by the handle itself.
    pub fn add_realm(&self, id: HandleId) -> Receiver<CommitNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push((id, tx));
        rx
    }

    /// Unsubscribes a handle.
    pub fn remove_realm(&self, id: HandleId) {
        self.subscribers.write().retain(|(sub, _)| *sub != id);
    }

    /// Number of subscribed handles.
    pub fn realm_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Announces a commit by `source` to every other handle and process.
    pub fn notify_others(&self, source: HandleId) {
        if let Some(note) = &self.note {
            note.signal();
        }
        let delivered = self.fan_out(CommitNotice {
            source: Some(source),
        });
        debug!(
            target: "realmkit::notifier",
            path = %self.path.display(),
            %source,
            delivered,
            "commit announced"
        );
    }

    fn poll_external(&self) {
        let Some(note) = &self.note else {
            return;
        };
        if note.poll() {
            let delivered = self.fan_out(CommitNotice { source: None });
            trace!(
                target: "realmkit::notifier",
                path = %self.path.display(),
                delivered,
                "external commit observed"
            );
        }
    }

    fn fan_out(&self, notice: CommitNotice) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|(id, tx)| Some(*id) == notice.source || tx.send(notice).is_ok());
        subscribers
            .iter()
            .filter(|(id, _)| Some(*id) != notice.source)
            .count()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("path", &self.path)
            .field("realms", &self.realm_count())
            .field("cross_process", &self.note.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn notices_skip_the_source() {
        let notifier = Notifier::start(Path::new("mem"), true, Duration::from_millis(10)).unwrap();
        let (a, b) = (HandleId::new(), HandleId::new());
        let rx_a = notifier.add_realm(a);
        let rx_b = notifier.add_realm(b);

        notifier.notify_others(a);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().source, Some(a));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let notifier = Notifier::start(Path::new("mem"), true, Duration::from_millis(10)).unwrap();
        let source = HandleId::new();
        let _rx = notifier.add_realm(source);
        drop(notifier.add_realm(HandleId::new()));
        assert_eq!(notifier.realm_count(), 2);

        notifier.notify_others(source);
        assert_eq!(notifier.realm_count(), 1);

        notifier.remove_realm(source);
        assert_eq!(notifier.realm_count(), 0);
    }

    #[test]
    fn note_file_carries_commits_between_notifiers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.realm");
        let here = Notifier::start(&path, false, Duration::from_millis(5)).unwrap();
        let there = Notifier::start(&path, false, Duration::from_millis(5)).unwrap();
        let rx = there.add_realm(HandleId::new());

        here.notify_others(HandleId::new());
        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(notice.source, None);
    }
}
