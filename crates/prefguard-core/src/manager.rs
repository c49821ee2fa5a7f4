//! Wiring of a profile's preference store to its tamper filter.

use crate::config::PrefGuardConfig;
use crate::digest::{machine_device_id, DigestCalculator};
use crate::error::PrefStoreError;
use crate::filter::{TamperFilter, RESET_TIME_PREF};
use crate::hash_store::{HashStore, HashStoreVersion};
use crate::local_state::LocalState;
use crate::metrics::{names, MetricsSink};
use crate::paths;
use crate::pref_store::{DictionaryPrefStore, JsonPrefStore, PrefFilter, PrefMap, PrefStore};
use crate::storage::write_atomically;
use crate::tracked::TrackedPreferenceMetadata;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct StoreManager {
    profile_path: PathBuf,
    tracked: Arc<[TrackedPreferenceMetadata]>,
    reporting_ids_count: usize,
    calculator: DigestCalculator,
    local_state: Arc<LocalState>,
    metrics: Arc<dyn MetricsSink>,
    tracking_enabled: bool,
    migration_in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("profile_path", &self.profile_path)
            .field("tracked", &self.tracked.len())
            .field("tracking_enabled", &self.tracking_enabled)
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when the migration task ends, however it ends.
struct MigrationSlot(Arc<AtomicBool>);

impl Drop for MigrationSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StoreManager {
    pub fn new(
        profile_path: impl Into<PathBuf>,
        tracked: Vec<TrackedPreferenceMetadata>,
        reporting_ids_count: usize,
        seed: &[u8],
        device_id: &str,
        local_state: Arc<LocalState>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Ok(Self {
            profile_path: profile_path.into(),
            tracked: tracked.into(),
            reporting_ids_count,
            calculator: DigestCalculator::new(seed, device_id)?,
            local_state,
            metrics,
            tracking_enabled: true,
            migration_in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_config(
        profile_path: impl Into<PathBuf>,
        config: &PrefGuardConfig,
        local_state: Arc<LocalState>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let seed = config.seed_bytes()?;
        let device_id = config
            .device_id
            .clone()
            .unwrap_or_else(machine_device_id);
        let manager = Self::new(
            profile_path,
            config.tracked.clone(),
            config.reporting_ids_count(),
            &seed,
            &device_id,
            local_state,
            metrics,
        )?;
        Ok(manager.with_tracking_enabled(config.tracking_enabled))
    }

    /// With tracking disabled every entry point is a no-op and stores are
    /// created without a filter.
    pub fn with_tracking_enabled(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    pub fn profile_path(&self) -> &Path {
        &self.profile_path
    }

    /// Key of this profile's digests in local state.
    pub fn profile_id(&self) -> String {
        self.profile_path.display().to_string()
    }

    pub fn pref_file_path(&self) -> PathBuf {
        paths::pref_file_path(&self.profile_path)
    }

    pub fn hash_store_version(&self) -> Option<HashStoreVersion> {
        self.hash_store().current_version()
    }

    fn hash_store(&self) -> HashStore {
        HashStore::new(
            self.calculator.clone(),
            self.local_state.clone(),
            &self.profile_id(),
        )
    }

    fn tamper_filter(&self) -> TamperFilter {
        TamperFilter::new(
            self.hash_store(),
            self.tracked.clone(),
            self.reporting_ids_count,
            self.metrics.clone(),
        )
    }

    /// Builds the profile's store. Loading is left to the caller.
    pub fn create_store(&self, io: &Handle) -> Arc<JsonPrefStore> {
        let filter: Option<Box<dyn PrefFilter>> = if self.tracking_enabled {
            Some(Box::new(self.tamper_filter()))
        } else {
            None
        };
        JsonPrefStore::new(self.pref_file_path(), io.clone(), filter)
    }

    /// Starts a background migration when the digests are missing or
    /// outdated. The migration reads the preferences through a store of its
    /// own so the profile's store never waits on it. Returns the task, or
    /// `None` if nothing needed doing or a migration is already running.
    pub fn update_hash_store_if_stale(&self, io: &Handle) -> Option<JoinHandle<()>> {
        if !self.tracking_enabled {
            return None;
        }
        let filter = self.tamper_filter();
        let current = filter.current_version();
        self.metrics.record_enumeration(
            names::ALTERNATE_STORE_VERSION,
            HashStoreVersion::metric_sample(current),
            HashStoreVersion::METRIC_BOUNDARY,
        );
        if current == Some(HashStoreVersion::LATEST) {
            debug!(profile = %self.profile_id(), "hash store is current");
            return None;
        }
        if self
            .migration_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(profile = %self.profile_id(), "hash store migration already running");
            return None;
        }
        let slot = MigrationSlot(self.migration_in_flight.clone());

        info!(profile = %self.profile_id(), from = ?current, "hash store is stale, migrating");
        let store = JsonPrefStore::new(self.pref_file_path(), io.clone(), None);
        let metrics = self.metrics.clone();
        Some(io.spawn(migrate_hash_store(store, filter, metrics, slot)))
    }

    /// Writes `values` as the profile's preferences and digests them in one
    /// synchronous step. Intended for first run, before anything else reads
    /// the profile.
    pub fn initialize_from_master_prefs(&self, values: &PrefMap) -> bool {
        let result = self.seed_master_prefs(values);
        if let Err(err) = &result {
            error!(profile = %self.profile_id(), error = %err, "cannot seed master preferences");
        }
        let success = result.is_ok();
        self.metrics
            .record_boolean(names::INITIALIZED_FROM_MASTER_PREFS, success);
        success
    }

    fn seed_master_prefs(&self, values: &PrefMap) -> Result<(), PrefStoreError> {
        fs::create_dir_all(&self.profile_path).map_err(|source| {
            PrefStoreError::DirectoryCreation {
                path: self.profile_path.clone(),
                source,
            }
        })?;
        let path = self.pref_file_path();
        let json = serde_json::to_vec_pretty(values).map_err(|e| PrefStoreError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomically(&path, &json).map_err(|e| PrefStoreError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if self.tracking_enabled {
            self.tamper_filter()
                .initialize(&DictionaryPrefStore::new(values))?;
        }
        info!(path = %path.display(), "preferences seeded from master preferences");
        Ok(())
    }

    pub fn reset_pref_hash_store(&self) {
        if !self.tracking_enabled {
            return;
        }
        if let Err(err) = self.hash_store().reset() {
            error!(profile = %self.profile_id(), error = %err, "cannot reset hash store");
        }
    }

    /// Drops the digests of every profile known to `local_state`.
    pub fn reset_all_pref_hash_stores(local_state: &LocalState) {
        match local_state.clear_hash_stores() {
            Ok(()) => info!("all preference hash stores reset"),
            Err(err) => error!(error = %err, "cannot reset preference hash stores"),
        }
    }

    /// When tracked preferences were last reset by enforcement.
    pub fn get_reset_time(store: &dyn PrefStore) -> Option<DateTime<Utc>> {
        TamperFilter::reset_time(store)
    }

    pub fn clear_reset_time(store: &JsonPrefStore) {
        if let Err(err) = store.remove_value(RESET_TIME_PREF) {
            warn!(error = %err, "cannot clear preference reset time");
        }
    }
}

async fn migrate_hash_store(
    store: Arc<JsonPrefStore>,
    mut filter: TamperFilter,
    metrics: Arc<dyn MetricsSink>,
    _slot: MigrationSlot,
) {
    let read = store.read_prefs().await;
    if !read.is_success() {
        warn!(result = ?read, "migration reader could not load preferences");
        return;
    }
    match filter.initialize_if_stale(&*store) {
        Ok(Some(migration)) => metrics.record_enumeration(
            names::ALTERNATE_STORE_VERSION_UPDATED_FROM,
            HashStoreVersion::metric_sample(migration.from),
            HashStoreVersion::METRIC_BOUNDARY,
        ),
        Ok(None) => debug!("hash store was brought current while the migration reader loaded"),
        Err(err) => error!(error = %err, "hash store migration failed"),
    }
}
