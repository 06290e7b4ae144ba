//! # tidelog Storage
//!
//! Byte-level file access for tidelog.
//!
//! This crate is the lowest layer of the log store. It knows nothing about
//! headers, records or sync markers; it only moves bytes between memory and
//! files.
//!
//! ## Available Types
//!
//! - [`StorageBackend`] - Read-side byte source used to decode archives
//! - [`FileBackend`] - Read-only view of an immutable file on disk
//! - [`InMemoryBackend`] - For testing
//! - [`MappedFile`] - Fixed-size, page-multiple, writable memory map
//! - [`append_mapped`] - Appends bytes to a file through a page-aligned tail map
//!
//! ## Example
//!
//! ```rust
//! use tidelog_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::with_data(b"hello world".to_vec());
//! let data = backend.read_at(6, 5).unwrap();
//! assert_eq!(&data, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod mapped;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use mapped::{append_mapped, page_size, round_up_to_page, MappedFile};
pub use memory::InMemoryBackend;
