//! # dirload storage
//!
//! Scratch byte stores for the dirload bulk-load engine.
//!
//! Phase one of an import spills sorted index records into scratch files and
//! phase two reads them back in large sequential windows. This crate provides
//! the byte-level backends for those files. Backends are **opaque byte
//! stores**: they never interpret the records they hold.
//!
//! ## Design Principles
//!
//! - Backends are append-only while written and random-read afterwards
//! - No knowledge of the scratch record layout or offset index format
//! - Must be `Send + Sync` so several merge cursors can share one file
//! - A backend can be discarded, which releases and deletes its storage
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and small imports
//! - [`FileBackend`] - Buffered file storage for real scratch directories
//!
//! ## Example
//!
//! ```rust
//! use dirload_storage::{ScratchBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let mut window = [0u8; 5];
//! let read = backend.read_into(offset + 6, &mut window).unwrap();
//! assert_eq!(&window[..read], b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::ScratchBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, DEFAULT_WRITE_BUFFER_SIZE};
pub use memory::InMemoryBackend;
