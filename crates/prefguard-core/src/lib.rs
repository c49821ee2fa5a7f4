//! Tamper protection for a profile's preference file.
//!
//! Tracked preferences are digested with a keyed MAC bound to the machine.
//! The digests live outside the preference file, in the shared local state,
//! and are checked every time the file is loaded.

pub mod config;
pub mod digest;
pub mod error;
pub mod filter;
pub mod hash_store;
pub mod local_state;
pub mod manager;
pub mod metrics;
pub mod paths;
pub mod pref_store;
pub mod storage;
pub mod tracked;

pub use config::PrefGuardConfig;
pub use error::{ConfigError, PrefStoreError};
pub use filter::{FilterState, LoadReport, TamperFilter, RESET_TIME_PREF};
pub use hash_store::{HashStore, HashStoreVersion, ValueState};
pub use local_state::LocalState;
pub use manager::StoreManager;
pub use metrics::{MetricsSink, RecordingMetrics, TracingMetrics};
pub use pref_store::{JsonPrefStore, PrefMap, PrefReadError, PrefStore};
pub use tracked::{EnforcementLevel, TrackedPreferenceMetadata};
