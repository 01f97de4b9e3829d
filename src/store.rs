use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Relative, `/`-separated key into a shared store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> StoreResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(invalid(key, "key is empty"));
        }
        if key.starts_with('/') {
            return Err(invalid(key, "key must be relative"));
        }
        if key.contains('\\') {
            return Err(invalid(key, "key must use '/' as separator"));
        }
        for component in key.split('/') {
            match component {
                "" => return Err(invalid(key, "key contains an empty component")),
                "." | ".." => return Err(invalid(key, "key contains a relative component")),
                _ => {}
            }
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn join(&self, child: &str) -> StoreResult<Self> {
        StoreKey::new(format!("{}/{}", self.0, child))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn invalid(key: String, reason: &'static str) -> StoreError {
    StoreError::InvalidKey { key, reason }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail if the key already exists.
    CreateNew,
    /// Accept an existing key only when it already holds identical bytes.
    Idempotent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Unchanged,
}

/// Durable key-addressed blob area reachable by every producer and the collector.
///
/// Puts are atomic per key: readers observe either nothing or the full payload.
pub trait SharedStore: Send + Sync {
    fn put(&self, key: &StoreKey, data: &[u8], mode: PutMode) -> StoreResult<PutOutcome>;

    fn get(&self, key: &StoreKey) -> StoreResult<Vec<u8>>;

    /// Keys stored directly under `dir` (or at the root), sorted.
    fn list(&self, dir: Option<&StoreKey>) -> StoreResult<Vec<StoreKey>>;

    fn remove(&self, key: &StoreKey) -> StoreResult<()>;

    /// Read the entry and drop it from the store.
    fn take(&self, key: &StoreKey) -> StoreResult<Vec<u8>> {
        let data = self.get(key)?;
        self.remove(key)?;
        Ok(data)
    }
}

pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
