use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::Builder;
use tracing::debug;

use super::{PutMode, PutOutcome, SharedStore, StoreKey, StoreResult, content_digest};
use crate::error::StoreError;

const TEMP_PREFIX: &str = ".relay-tmp-";

/// Shared store backed by a directory, e.g. a volume mounted into every container.
///
/// Key components map to nested directories under `root`. Writes land in a
/// temporary file next to the target and are renamed into place.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &StoreKey) -> PathBuf {
        key.components()
            .fold(self.root.clone(), |path, component| path.join(component))
    }

    fn matches_existing(&self, path: &Path, data: &[u8]) -> StoreResult<bool> {
        let existing = fs::read(path)?;
        Ok(content_digest(&existing) == content_digest(data))
    }
}

impl SharedStore for FsStore {
    fn put(&self, key: &StoreKey, data: &[u8], mode: PutMode) -> StoreResult<PutOutcome> {
        let path = self.path_for(key);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)?;

        if mode == PutMode::Idempotent && path.is_file() {
            return if self.matches_existing(&path, data)? {
                debug!(key = %key, "Identical entry already stored");
                Ok(PutOutcome::Unchanged)
            } else {
                Err(StoreError::KeyExists(key.to_string()))
            };
        }

        let mut tmp = Builder::new().prefix(TEMP_PREFIX).tempfile_in(&parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(PutOutcome::Created),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                // Lost a race against another writer for the same key.
                if mode == PutMode::Idempotent && self.matches_existing(&path, data)? {
                    Ok(PutOutcome::Unchanged)
                } else {
                    Err(StoreError::KeyExists(key.to_string()))
                }
            }
            Err(err) => Err(StoreError::Io(err.error)),
        }
    }

    fn get(&self, key: &StoreKey) -> StoreResult<Vec<u8>> {
        fs::read(self.path_for(key)).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })
    }

    fn list(&self, dir: Option<&StoreKey>) -> StoreResult<Vec<StoreKey>> {
        let path = match dir {
            Some(dir) => self.path_for(dir),
            None => self.root.clone(),
        };
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let key = match dir {
                Some(dir) => dir.join(&name)?,
                None => StoreKey::new(name)?,
            };
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &StoreKey) -> StoreResult<()> {
        fs::remove_file(self.path_for(key)).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })
    }
}
