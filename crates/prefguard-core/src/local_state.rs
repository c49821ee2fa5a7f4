//! Process-wide side-channel file holding the digest records of every
//! profile. Digests live here rather than next to the values they protect
//! so a process rewriting one profile's preferences file cannot also rewrite
//! the matching digests in place.

use crate::error::PrefStoreError;
use crate::hash_store::HashStoreVersion;
use crate::storage::{read_if_exists, write_atomically};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalStateData {
    #[serde(default)]
    pub preference_hash_stores: BTreeMap<String, HashStoreRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashStoreRecord {
    /// Absent in files written before versioning existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<HashStoreVersion>,
    #[serde(default)]
    pub digests: BTreeMap<String, DigestRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DigestRecord {
    pub hash: String,
    pub reporting_id: usize,
    #[serde(default = "legacy_version")]
    pub version: HashStoreVersion,
}

fn legacy_version() -> HashStoreVersion {
    HashStoreVersion::Legacy
}

#[derive(Debug)]
pub struct LocalState {
    path: Option<PathBuf>,
    data: Mutex<LocalStateData>,
}

impl LocalState {
    /// Loads the file at `path`. A missing file is an empty state; an
    /// unreadable one is discarded, which leaves every profile untrusted
    /// until it is re-seeded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PrefStoreError> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_if_exists(&path).map_err(|source| PrefStoreError::Io {
            path: path.clone(),
            source,
        })?;
        let data = match bytes {
            None => LocalStateData::default(),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "local state unreadable, starting empty");
                    LocalStateData::default()
                }
            },
        };
        debug!(
            path = %path.display(),
            profiles = data.preference_hash_stores.len(),
            "local state loaded"
        );
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// A state that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(LocalStateData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn hash_store(&self, profile_id: &str) -> Option<HashStoreRecord> {
        self.data.lock().preference_hash_stores.get(profile_id).cloned()
    }

    pub fn profile_ids(&self) -> Vec<String> {
        self.data
            .lock()
            .preference_hash_stores
            .keys()
            .cloned()
            .collect()
    }

    /// Mutates one profile's record and persists the whole state. The change
    /// only becomes visible once it is on disk.
    pub fn update_hash_store<R>(
        &self,
        profile_id: &str,
        f: impl FnOnce(&mut HashStoreRecord) -> R,
    ) -> Result<R, PrefStoreError> {
        let mut data = self.data.lock();
        let mut next = data.clone();
        let out = f(next
            .preference_hash_stores
            .entry(profile_id.to_string())
            .or_default());
        self.persist(&next)?;
        *data = next;
        Ok(out)
    }

    /// Like [`LocalState::update_hash_store`], but `f` may decline by
    /// returning `None`, in which case nothing is written. The decision and
    /// the write happen under one lock.
    pub fn modify_hash_store<R>(
        &self,
        profile_id: &str,
        f: impl FnOnce(&mut HashStoreRecord) -> Option<R>,
    ) -> Result<Option<R>, PrefStoreError> {
        let mut data = self.data.lock();
        let mut next = data.clone();
        let record = next
            .preference_hash_stores
            .entry(profile_id.to_string())
            .or_default();
        let Some(out) = f(record) else {
            return Ok(None);
        };
        self.persist(&next)?;
        *data = next;
        Ok(Some(out))
    }

    pub fn remove_hash_store(&self, profile_id: &str) -> Result<(), PrefStoreError> {
        let mut data = self.data.lock();
        if !data.preference_hash_stores.contains_key(profile_id) {
            return Ok(());
        }
        let mut next = data.clone();
        next.preference_hash_stores.remove(profile_id);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    pub fn clear_hash_stores(&self) -> Result<(), PrefStoreError> {
        let mut data = self.data.lock();
        let next = LocalStateData::default();
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn persist(&self, data: &LocalStateData) -> Result<(), PrefStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data).map_err(|e| PrefStoreError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomically(path, &json).map_err(|source| PrefStoreError::Io {
            path: path.clone(),
            source,
        })
    }
}
