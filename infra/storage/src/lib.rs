//! Sandboxed, blocking filesystem primitives for the quota workers.
//!
//! Every call blocks the calling thread, so callers are expected to run on a blocking pool
//! (see `qhub_runtime::Executors::spawn_io`). All paths are relative to a canonical root and are
//! validated before touching the disk.
//!
//! # Core Features
//!
//! - **Sandbox Security**: Strict path traversal protection using physical path canonicalization.
//! - **Atomic Writes**: unique temp write + `fsync` + `rename`, so readers never see a torn file.
//! - **Transparent Compression**: optional LZ4 block compression for file payloads.
//! - **Directory Accounting**: recursive size and child listing used by usage scans.
//! - **Self-Healing**: orphaned temporary files are removed when the handle is opened.
//!
//! # Examples
//!
//! ```rust
//! use qhub_storage::{Compression, Storage, StorageError};
//!
//! fn main() -> Result<(), StorageError> {
//!     # let tmp = tempfile::tempdir().unwrap();
//!     # let root = tmp.path().join("data");
//!     let storage = Storage::builder()
//!         .root(&root)
//!         .create(true)
//!         .compression(Compression::Lz4)
//!         .open()?;
//!
//!     storage.create_dir("default/https+++example.com")?;
//!     storage.write("default/https+++example.com/.metadata", b"important data")?;
//!     assert_eq!(storage.read("default/https+++example.com/.metadata")?, b"important data");
//!     assert!(storage.dir_size("default")? > 0);
//!
//!     Ok(())
//! }
//! ```

mod builder;
mod engine;
mod error;
mod maintenance;
mod security;

pub use builder::StorageBuilder;
pub use engine::{Compression, Storage, TMP_MARKER};
pub use error::{StorageError, StorageErrorExt};
