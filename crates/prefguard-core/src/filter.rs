//! Tamper detection for a bound preference store.
//!
//! The filter digests tracked values as they are written and verifies them
//! when the store loads. Enforced preferences that fail verification are put
//! back to their safe default and the time of the reset is recorded in the
//! store itself.

use crate::error::PrefStoreError;
use crate::hash_store::{HashStore, HashStoreVersion, Migration, ValueState};
use crate::metrics::{names, MetricsSink};
use crate::pref_store::{PrefFilter, PrefMap, PrefStore};
use crate::tracked::TrackedPreferenceMetadata;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Preference holding the Unix time of the last enforcement reset.
pub const RESET_TIME_PREF: &str = "prefs.preference_reset_time";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Unattached,
    /// Bound to a store whose digests are missing or outdated; the next load
    /// seeds them instead of checking.
    Initializing,
    Attached,
}

/// Outcome of one verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub changed: Vec<String>,
    pub cleared: Vec<String>,
    pub untrusted: Vec<String>,
    pub reset: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty() && self.cleared.is_empty() && self.untrusted.is_empty()
    }
}

pub struct TamperFilter {
    hash_store: HashStore,
    tracked: Arc<[TrackedPreferenceMetadata]>,
    reporting_ids_count: usize,
    metrics: Arc<dyn MetricsSink>,
    state: FilterState,
    last_report: Option<LoadReport>,
}

impl std::fmt::Debug for TamperFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TamperFilter")
            .field("profile", &self.hash_store.profile_id())
            .field("tracked", &self.tracked.len())
            .field("state", &self.state)
            .finish()
    }
}

impl TamperFilter {
    pub fn new(
        hash_store: HashStore,
        tracked: Arc<[TrackedPreferenceMetadata]>,
        reporting_ids_count: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            hash_store,
            tracked,
            reporting_ids_count,
            metrics,
            state: FilterState::Unattached,
            last_report: None,
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn current_version(&self) -> Option<HashStoreVersion> {
        self.hash_store.current_version()
    }

    /// Findings of the most recent load, if one was checked.
    pub fn last_report(&self) -> Option<&LoadReport> {
        self.last_report.as_ref()
    }

    /// Seeds digests for every tracked key from `store`, migrating older
    /// digests first, and attaches the filter. On error nothing is recorded
    /// and the filter state is left as it was.
    pub fn initialize(&mut self, store: &dyn PrefStore) -> Result<(), PrefStoreError> {
        let migration = match self.hash_store.migrate(&self.tracked, store)? {
            Some(migration) => migration,
            None => {
                self.hash_store.initialize(&self.tracked, store)?;
                Migration {
                    from: Some(HashStoreVersion::LATEST),
                    divergent: Vec::new(),
                }
            }
        };
        self.on_seeded(&migration);
        Ok(())
    }

    /// Seeds digests only if they are still missing or outdated. Returns
    /// what was migrated, or `None` if the store was already current. The
    /// filter is attached either way.
    pub fn initialize_if_stale(
        &mut self,
        store: &dyn PrefStore,
    ) -> Result<Option<Migration>, PrefStoreError> {
        let migration = self.hash_store.migrate(&self.tracked, store)?;
        match &migration {
            Some(migration) => self.on_seeded(migration),
            None => self.state = FilterState::Attached,
        }
        Ok(migration)
    }

    fn on_seeded(&mut self, migration: &Migration) {
        for d in &migration.divergent {
            warn!(
                key = %d.key,
                state = ?d.state,
                "tracked preference diverged from its pre-migration digest"
            );
            self.metrics.record_enumeration(
                names::TRACKED_PREFERENCE_MIGRATION_DIVERGED,
                d.reporting_id,
                self.reporting_ids_count,
            );
        }
        self.metrics.record_enumeration(
            names::HASH_STORE_VERSION_UPDATED_FROM,
            HashStoreVersion::metric_sample(migration.from),
            HashStoreVersion::METRIC_BOUNDARY,
        );
        info!(
            profile = %self.hash_store.profile_id(),
            from = ?migration.from,
            to = ?HashStoreVersion::LATEST,
            "preference digests initialized"
        );
        self.state = FilterState::Attached;
    }

    /// Verifies every tracked key and enforces policy on the findings.
    /// Returns `true` if `prefs` were modified.
    fn check_and_enforce(&mut self, prefs: &mut PrefMap) -> bool {
        let mut report = LoadReport::default();
        let tracked = self.tracked.clone();
        for pref in tracked.iter() {
            let value = prefs.get(&pref.name).cloned();
            let state = self.hash_store.check_value(&pref.name, value.as_ref());
            let metric = match state {
                ValueState::Unchanged => names::TRACKED_PREFERENCE_UNCHANGED,
                ValueState::Changed => names::TRACKED_PREFERENCE_CHANGED,
                ValueState::Cleared => names::TRACKED_PREFERENCE_CLEARED,
                ValueState::Untrusted => names::TRACKED_PREFERENCE_UNTRUSTED,
            };
            self.metrics
                .record_enumeration(metric, pref.reporting_id, self.reporting_ids_count);

            match state {
                ValueState::Unchanged => continue,
                ValueState::Changed => report.changed.push(pref.name.clone()),
                ValueState::Cleared => report.cleared.push(pref.name.clone()),
                ValueState::Untrusted => report.untrusted.push(pref.name.clone()),
            }
            warn!(
                key = %pref.name,
                state = ?state,
                value = %pref.loggable(value.as_ref()),
                enforced = pref.is_enforced(),
                "tracked preference failed verification"
            );

            let enforce = pref.is_enforced()
                && matches!(state, ValueState::Changed | ValueState::Untrusted);
            if enforce {
                match &pref.default {
                    Some(default) => prefs.set(&pref.name, default.clone()),
                    None => {
                        prefs.remove(&pref.name);
                    }
                }
                self.metrics.record_enumeration(
                    names::TRACKED_PREFERENCE_RESET,
                    pref.reporting_id,
                    self.reporting_ids_count,
                );
                report.reset.push(pref.name.clone());
            }
            // Report-only findings are accepted so they are reported once.
            self.store_hash(pref, prefs.get(&pref.name));
        }

        let modified = !report.reset.is_empty();
        if modified {
            prefs.set(RESET_TIME_PREF, Value::from(Utc::now().timestamp()));
            warn!(
                profile = %self.hash_store.profile_id(),
                reset = report.reset.len(),
                "tracked preferences reset to defaults"
            );
        } else if report.is_clean() {
            debug!(profile = %self.hash_store.profile_id(), "tracked preferences verified");
        }
        self.last_report = Some(report);
        modified
    }

    fn store_hash(&mut self, pref: &TrackedPreferenceMetadata, value: Option<&Value>) {
        if let Err(err) = self.hash_store.store_hash(&pref.name, pref.reporting_id, value) {
            error!(key = %pref.name, error = %err, "cannot store preference digest");
        }
    }

    fn tracked_pref(&self, key: &str) -> Option<TrackedPreferenceMetadata> {
        self.tracked.iter().find(|p| p.name == key).cloned()
    }

    pub fn reset_time(store: &dyn PrefStore) -> Option<DateTime<Utc>> {
        let secs = store.get_value(RESET_TIME_PREF)?.as_i64()?;
        DateTime::<Utc>::from_timestamp(secs, 0)
    }
}

impl PrefFilter for TamperFilter {
    fn on_attach(&mut self) {
        if self.state != FilterState::Unattached {
            return;
        }
        self.state = if self.hash_store.current_version() < Some(HashStoreVersion::LATEST) {
            FilterState::Initializing
        } else {
            FilterState::Attached
        };
        debug!(state = ?self.state, "tamper filter bound");
    }

    fn filter_on_load(&mut self, prefs: &mut PrefMap) -> bool {
        if self.state == FilterState::Unattached {
            self.on_attach();
        }
        match self.state {
            FilterState::Initializing => match self.initialize_if_stale(&*prefs) {
                Ok(Some(_)) => false,
                // brought current by someone else since attach
                Ok(None) => self.check_and_enforce(prefs),
                Err(err) => {
                    error!(error = %err, "cannot seed digests, preferences left unverified");
                    false
                }
            },
            FilterState::Attached => self.check_and_enforce(prefs),
            FilterState::Unattached => false,
        }
    }

    fn filter_update(&mut self, key: &str, prefs: &PrefMap) {
        if self.state != FilterState::Attached {
            return;
        }
        if let Some(pref) = self.tracked_pref(key) {
            self.store_hash(&pref, prefs.get(key));
        }
    }
}
