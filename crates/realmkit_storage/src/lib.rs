//! # realmkit storage
//!
//! Byte-store backends for the realmkit storage session.
//!
//! A backend is an **opaque, append-mostly byte store**. The storage session
//! in `realmkit_core` owns the commit-log format (file header, commit frames,
//! encryption); backends only move bytes.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for in-memory realms and tests
//! - [`FileBackend`] - for realms persisted to a file
//!
//! ## Example
//!
//! ```rust
//! use realmkit_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
