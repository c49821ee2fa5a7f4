//! Fire-and-forget metrics. Recording never fails and never blocks on IO.

use parking_lot::Mutex;
use tracing::{debug, warn};

pub mod names {
    pub const TRACKED_PREFERENCE_UNCHANGED: &str = "settings.tracked_preference_unchanged";
    pub const TRACKED_PREFERENCE_CHANGED: &str = "settings.tracked_preference_changed";
    pub const TRACKED_PREFERENCE_CLEARED: &str = "settings.tracked_preference_cleared";
    pub const TRACKED_PREFERENCE_UNTRUSTED: &str = "settings.tracked_preference_untrusted";
    pub const TRACKED_PREFERENCE_RESET: &str = "settings.tracked_preference_reset";
    pub const TRACKED_PREFERENCE_MIGRATION_DIVERGED: &str =
        "settings.tracked_preference_migration_diverged";
    pub const HASH_STORE_VERSION_UPDATED_FROM: &str = "settings.hash_store_version_updated_from";
    pub const ALTERNATE_STORE_VERSION: &str = "settings.alternate_store_version";
    pub const ALTERNATE_STORE_VERSION_UPDATED_FROM: &str =
        "settings.alternate_store_version_updated_from";
    pub const INITIALIZED_FROM_MASTER_PREFS: &str = "settings.initialized_from_master_prefs";
}

pub trait MetricsSink: Send + Sync {
    /// Records `sample` in an enumeration with values in `0..boundary`.
    fn record_enumeration(&self, name: &str, sample: usize, boundary: usize);
    fn record_boolean(&self, name: &str, sample: bool);
}

/// Emits every sample as a debug-level tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_enumeration(&self, name: &str, sample: usize, boundary: usize) {
        if sample >= boundary {
            warn!(metric = name, sample, boundary, "enumeration sample out of range");
            return;
        }
        debug!(metric = name, sample, boundary, "metric");
    }

    fn record_boolean(&self, name: &str, sample: bool) {
        debug!(metric = name, sample, "metric");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSample {
    Enumeration {
        name: String,
        sample: usize,
        boundary: usize,
    },
    Boolean {
        name: String,
        sample: bool,
    },
}

/// Keeps every sample in memory, for reports and tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    samples: Mutex<Vec<MetricSample>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().clone()
    }

    /// Enumeration samples recorded under `name`, in order.
    pub fn enumeration(&self, name: &str) -> Vec<usize> {
        self.samples
            .lock()
            .iter()
            .filter_map(|s| match s {
                MetricSample::Enumeration { name: n, sample, .. } if n == name => Some(*sample),
                _ => None,
            })
            .collect()
    }

    pub fn booleans(&self, name: &str) -> Vec<bool> {
        self.samples
            .lock()
            .iter()
            .filter_map(|s| match s {
                MetricSample::Boolean { name: n, sample } if n == name => Some(*sample),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_enumeration(&self, name: &str, sample: usize, boundary: usize) {
        self.samples.lock().push(MetricSample::Enumeration {
            name: name.to_string(),
            sample,
            boundary,
        });
    }

    fn record_boolean(&self, name: &str, sample: bool) {
        self.samples.lock().push(MetricSample::Boolean {
            name: name.to_string(),
            sample,
        });
    }
}
