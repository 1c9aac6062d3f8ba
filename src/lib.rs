//! Unified storage abstraction with a synchronization engine on top.
//!
//! Backends implement the narrow [`fs::Backend`] contract (byte-stream
//! read/write, listing, idempotent delete) plus optional extended
//! operations advertised through [`fs::Features`]. On top of that contract
//! the [`sync`] module provides one-way mirroring, bidirectional
//! reconciliation, and verification, with glob/size/age filtering, shared
//! token-bucket bandwidth limiting, and retry with exponential backoff.

pub mod fs;
pub mod sync;

pub use fs::{
    Backend, Features, LocalBackend, MemoryBackend, ObjectReader, ObjectStat, ObjectWriter,
    ReadOptions, StorageError, WriteOptions,
};
pub use sync::{
    BandwidthLimit, BisyncEngine, BisyncOptions, BisyncReport, CheckReport, Checker,
    ConflictStrategy, FileError, FileInfo, Filter, Phase, PreserveMetadata, Progress, RetryConfig,
    SyncEngine, SyncOptions, SyncReport,
};
