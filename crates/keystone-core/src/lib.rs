//! Keystone Core: storage-handler contract for an embedded relational engine
//!
//! The seam the SQL execution layer uses to touch persistent state, plus the
//! primitives it is built from.
//!
//! # Architecture
//!
//! - **Checksums**: every persisted block carries a CRC32C; a mismatch goes
//!   to a pluggable [`InvalidChecksumPolicy`] instead of failing silently
//! - **Power-failure injection**: a shared countdown that makes the N-th
//!   write fail as if power were cut, for crash-consistency tests
//! - **Block files**: append-only checksummed blocks whose recovery drops a
//!   torn tail and keeps every committed block
//! - **LOB ids**: [`ObjectId`] allocation with fresh/recycled semantics and a
//!   persisted high-water mark
//! - **[`IntIntMap`]**: a primitive `i32 -> i32` open-addressing map
//!
//! [`StorageHandle`] composes all of these. Session-level concerns (exclusive
//! mode, result caching) live in `keystone-session`.

pub mod block_file;
pub mod checksum;
pub mod config;
pub mod error;
pub mod file_store;
pub mod ids;
pub mod int_int_map;
pub mod object_id;
pub mod power_failure;
pub mod storage;

// Re-export key types for convenience
pub use block_file::{BlockFile, Recovery};
pub use checksum::{ChecksumMismatch, FailOnCorruption, InvalidChecksumPolicy, SkipCorrupted};
pub use config::{CompressionAlgorithm, Config};
pub use error::{StorageError, StoreResult};
pub use file_store::{AccessMode, FileStore};
pub use ids::{ObjectId, SessionId};
pub use int_int_map::{IntIntMap, NOT_FOUND};
pub use object_id::ObjectIdAllocator;
pub use power_failure::PowerFailureSimulator;
pub use storage::{LobType, StorageHandle, WriteState};
