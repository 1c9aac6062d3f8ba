pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{
    join_path, Backend, Features, ObjectReader, ObjectStat, ObjectWriter, ReadOptions,
    WriteOptions,
};
pub use error::{validate_path, StorageError};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
