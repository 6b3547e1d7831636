//! SharedStore - durable key-value store shared across execution contexts
//!
//! Several independent processes (or several schedulers inside one process)
//! coordinate through a flat namespace of string keys holding string values.
//!
//! # Consistency
//!
//! There is no locking and no transaction support. Each writer is expected to
//! own its keys exclusively, so concurrent writes never target the same key,
//! but a reader enumerating the namespace may observe a transiently stale view:
//! a key written by another context a moment ago may be missing, and a key it
//! removed may still be listed. Consumers must tolerate both.
//!
//! # Layout of a [`FileStore`]
//!
//! ```text
//! .sharedstore/
//! ├── admitgate.1718000000000    # one file per key, value as file content
//! └── admitgate.1718000004211
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sharedstore::{FileStore, SharedStore};
//!
//! let store = FileStore::open(".sharedstore")?;
//! store.set("admitgate.1", r#"{"currentCount":0,"lastActionAt":0}"#)?;
//! for key in store.keys()? {
//!     println!("{key}");
//! }
//! ```

pub mod cli;
pub mod config;
mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use thiserror::Error;

/// Errors raised by store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid key '{0}': keys must be non-empty plain names")]
    InvalidKey(String),

    #[error("I/O error for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// A string key-value store visible to every execution context
///
/// Implementations must be cheap to call from synchronous code; callers run
/// them while holding their own locks.
pub trait SharedStore: Send + Sync {
    /// Read the value stored under `key`, if any
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate all keys currently present
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Keys double as file names in [`FileStore`], so both stores reject the same shapes
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
        || key.chars().any(char::is_control);
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
