//! Blob stores: keys are content-derived [Pointer]s, values are opaque byte
//! regions. The store does not validate that keys match content; callers do.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::Pointer;

mod disk;
mod from_addr;
mod memory;
pub mod paired;

pub use disk::DiskStore;
pub use from_addr::from_addr;
pub use memory::MemoryStore;
pub use paired::PairedStore;

/// Errors related to communication with a store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Error::StorageError(value.to_string())
    }
}

/// The base trait all blob stores implement.
///
/// `put` is idempotent: keys are content hashes, so putting the same key
/// twice writes the same bytes. Stores trust the caller-supplied key and do
/// not hash the content again on the write path.
#[async_trait]
pub trait Store: Send + Sync {
    /// Retrieve a byte region, or `None` if the store has no such pointer.
    async fn get(&self, pointer: &Pointer) -> Result<Option<Bytes>, Error>;

    /// Store a byte region under the given pointer.
    async fn put(&self, pointer: &Pointer, data: Bytes) -> Result<(), Error>;

    /// Drop a byte region. Deleting an absent pointer is not an error.
    async fn delete(&self, pointer: &Pointer) -> Result<(), Error>;

    /// Check for the presence of a pointer.
    async fn contains(&self, pointer: &Pointer) -> Result<bool, Error>;
}
