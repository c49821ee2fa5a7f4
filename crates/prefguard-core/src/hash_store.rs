//! Per-profile digest records and their schema version.

use crate::digest::DigestCalculator;
use crate::error::PrefStoreError;
use crate::local_state::{DigestRecord, HashStoreRecord, LocalState};
use crate::pref_store::PrefStore;
use crate::tracked::TrackedPreferenceMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Digest schema versions in upgrade order. A store with no version at all
/// (`None`) sorts below every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HashStoreVersion {
    /// Digests keyed by seed only.
    #[serde(rename = "v1")]
    Legacy = 1,
    /// Digests keyed by seed and bound to the device id.
    #[serde(rename = "v2")]
    DeviceBound = 2,
}

impl HashStoreVersion {
    pub const LATEST: Self = Self::DeviceBound;
    /// Exclusive upper bound of [`HashStoreVersion::metric_sample`].
    pub const METRIC_BOUNDARY: usize = Self::LATEST as usize + 1;

    pub fn metric_sample(version: Option<Self>) -> usize {
        version.map_or(0, |v| v as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueState {
    Unchanged,
    /// The value differs from the one that was digested.
    Changed,
    /// The value is gone but a digest of a present value remains.
    Cleared,
    /// A value is present with no digest vouching for it.
    Untrusted,
}

/// Outcome of bringing a stale store to the latest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub from: Option<HashStoreVersion>,
    pub divergent: Vec<Divergence>,
}

/// A store without a version but with digests predates versioning.
fn record_version(record: &HashStoreRecord) -> Option<HashStoreVersion> {
    match record.version {
        Some(version) => Some(version),
        None if !record.digests.is_empty() => Some(HashStoreVersion::Legacy),
        None => None,
    }
}

/// Reads every tracked value up front so no store lock is held while the
/// digests are rewritten.
fn snapshot(tracked: &[TrackedPreferenceMetadata], store: &dyn PrefStore) -> Vec<Option<Value>> {
    tracked.iter().map(|pref| store.get_value(&pref.name)).collect()
}

/// A tracked key whose value no longer matched its pre-migration digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub key: String,
    pub reporting_id: usize,
    pub state: ValueState,
}

#[derive(Debug)]
pub struct HashStore {
    calculator: DigestCalculator,
    local_state: Arc<LocalState>,
    profile_id: String,
}

impl HashStore {
    pub fn new(calculator: DigestCalculator, local_state: Arc<LocalState>, profile_id: &str) -> Self {
        Self {
            calculator,
            local_state,
            profile_id: profile_id.to_string(),
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn current_version(&self) -> Option<HashStoreVersion> {
        self.local_state
            .hash_store(&self.profile_id)
            .and_then(|record| record_version(&record))
    }

    /// Drops every digest of this profile.
    pub fn reset(&mut self) -> Result<(), PrefStoreError> {
        self.local_state.remove_hash_store(&self.profile_id)?;
        info!(profile = %self.profile_id, "preference hash store reset");
        Ok(())
    }

    /// Digests every tracked key from `store` at the latest version,
    /// replacing whatever was recorded before.
    pub fn initialize(
        &mut self,
        tracked: &[TrackedPreferenceMetadata],
        store: &dyn PrefStore,
    ) -> Result<(), PrefStoreError> {
        let values = snapshot(tracked, store);
        self.local_state.update_hash_store(&self.profile_id, |record| {
            self.seed(record, tracked, &values);
        })?;
        debug!(profile = %self.profile_id, keys = tracked.len(), "hash store initialized");
        Ok(())
    }

    /// Brings a stale store to the latest version. Each step first compares
    /// the current values against the outgoing digests so divergence is
    /// known before those digests are replaced. The staleness check and the
    /// rewrite are one step, so a store that became current in the meantime
    /// is left alone and `None` is returned.
    pub fn migrate(
        &mut self,
        tracked: &[TrackedPreferenceMetadata],
        store: &dyn PrefStore,
    ) -> Result<Option<Migration>, PrefStoreError> {
        let values = snapshot(tracked, store);
        let migration = self.local_state.modify_hash_store(&self.profile_id, |record| {
            let from = record_version(record);
            let divergent = match from {
                None => Vec::new(),
                Some(HashStoreVersion::Legacy) => self.divergence(record, tracked, &values),
                Some(HashStoreVersion::DeviceBound) => return None,
            };
            self.seed(record, tracked, &values);
            Some(Migration { from, divergent })
        })?;
        if let Some(m) = &migration {
            debug!(profile = %self.profile_id, from = ?m.from, "hash store migrated");
        }
        Ok(migration)
    }

    fn seed(
        &self,
        record: &mut HashStoreRecord,
        tracked: &[TrackedPreferenceMetadata],
        values: &[Option<Value>],
    ) {
        let version = HashStoreVersion::LATEST;
        record.digests = tracked
            .iter()
            .zip(values)
            .map(|(pref, value)| {
                let digest = DigestRecord {
                    hash: self.calculator.digest(version, &pref.name, value.as_ref()),
                    reporting_id: pref.reporting_id,
                    version,
                };
                (pref.name.clone(), digest)
            })
            .collect::<BTreeMap<_, _>>();
        record.version = Some(version);
    }

    fn divergence(
        &self,
        record: &HashStoreRecord,
        tracked: &[TrackedPreferenceMetadata],
        values: &[Option<Value>],
    ) -> Vec<Divergence> {
        tracked
            .iter()
            .zip(values)
            .filter_map(|(pref, value)| {
                match self.compare(record.digests.get(&pref.name), &pref.name, value.as_ref()) {
                    ValueState::Unchanged => None,
                    state => Some(Divergence {
                        key: pref.name.clone(),
                        reporting_id: pref.reporting_id,
                        state,
                    }),
                }
            })
            .collect()
    }

    /// Compares `value` with the digest recorded for `key`, using the
    /// algorithm of the version that record was written with.
    pub fn check_value(&self, key: &str, value: Option<&Value>) -> ValueState {
        let record = self
            .local_state
            .hash_store(&self.profile_id)
            .and_then(|mut r| r.digests.remove(key));
        self.compare(record.as_ref(), key, value)
    }

    fn compare(&self, record: Option<&DigestRecord>, key: &str, value: Option<&Value>) -> ValueState {
        match (record, value) {
            (None, None) => ValueState::Unchanged,
            (None, Some(_)) => ValueState::Untrusted,
            (Some(record), value) => {
                if self
                    .calculator
                    .verify(record.version, key, value, &record.hash)
                {
                    ValueState::Unchanged
                } else if value.is_none() {
                    ValueState::Cleared
                } else {
                    ValueState::Changed
                }
            }
        }
    }

    /// Records the digest of `value` for one key at the latest version.
    pub fn store_hash(
        &mut self,
        key: &str,
        reporting_id: usize,
        value: Option<&Value>,
    ) -> Result<(), PrefStoreError> {
        let version = HashStoreVersion::LATEST;
        let record = DigestRecord {
            hash: self.calculator.digest(version, key, value),
            reporting_id,
            version,
        };
        self.local_state.update_hash_store(&self.profile_id, |r| {
            r.digests.insert(key.to_string(), record);
        })
    }
}
