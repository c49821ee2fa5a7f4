use crate::error::ConfigError;
use crate::storage::write_private;
use crate::tracked::{default_tracked_preferences, TrackedPreferenceMetadata};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

pub const SEED_LEN: usize = 32;

/// Tracking is unavailable where digests cannot be kept out of reach of the
/// profile itself.
pub const PLATFORM_SUPPORTS_TRACKING: bool = !cfg!(target_os = "android");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefGuardConfig {
    /// Hex-encoded HMAC key mixed into every digest.
    #[serde(default)]
    pub seed: String,
    /// Overrides the machine-derived device id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Upper bound of reporting ids; defaults to the largest id plus one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_ids_count: Option<usize>,
    #[serde(default = "default_tracking_enabled")]
    pub tracking_enabled: bool,
    #[serde(default = "default_tracked_preferences")]
    pub tracked: Vec<TrackedPreferenceMetadata>,
}

impl Default for PrefGuardConfig {
    fn default() -> Self {
        Self {
            seed: String::new(),
            device_id: None,
            reporting_ids_count: None,
            tracking_enabled: default_tracking_enabled(),
            tracked: default_tracked_preferences(),
        }
    }
}

fn default_tracking_enabled() -> bool {
    PLATFORM_SUPPORTS_TRACKING
}

impl PrefGuardConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if present, the built-in defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_private(path, &json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seed_bytes()?.is_empty() {
            return Err(ConfigError::MissingSeed);
        }
        let count = self.reporting_ids_count();
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for pref in &self.tracked {
            if !names.insert(pref.name.as_str()) {
                return Err(ConfigError::DuplicateName(pref.name.clone()));
            }
            if !ids.insert(pref.reporting_id) {
                return Err(ConfigError::DuplicateReportingId(pref.reporting_id));
            }
            if pref.reporting_id >= count {
                return Err(ConfigError::ReportingIdOutOfRange {
                    name: pref.name.clone(),
                    id: pref.reporting_id,
                    count,
                });
            }
        }
        Ok(())
    }

    pub fn seed_bytes(&self) -> Result<Zeroizing<Vec<u8>>, ConfigError> {
        Ok(Zeroizing::new(hex::decode(self.seed.trim())?))
    }

    pub fn reporting_ids_count(&self) -> usize {
        self.reporting_ids_count.unwrap_or_else(|| {
            self.tracked
                .iter()
                .map(|p| p.reporting_id + 1)
                .max()
                .unwrap_or(0)
        })
    }
}

pub fn generate_seed() -> String {
    let mut seed = Zeroizing::new([0u8; SEED_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut seed[..]);
    hex::encode(&seed[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::EnforcementLevel;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("prefguard.json");
        let config = PrefGuardConfig {
            seed: generate_seed(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = PrefGuardConfig::load(&path).unwrap();
        assert_eq!(loaded.seed, config.seed);
        assert_eq!(loaded.tracked, config.tracked);
        assert_eq!(loaded.seed_bytes().unwrap().len(), SEED_LEN);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = PrefGuardConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert!(config.seed.is_empty());
        assert_eq!(config.reporting_ids_count(), config.tracked.len());
    }

    #[test]
    fn rejects_duplicate_reporting_ids() {
        let config = PrefGuardConfig {
            tracked: vec![
                TrackedPreferenceMetadata::new("a", 0, EnforcementLevel::Enforce),
                TrackedPreferenceMetadata::new("b", 0, EnforcementLevel::ReportOnly),
            ],
            seed: generate_seed(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateReportingId(0))
        ));
    }

    #[test]
    fn rejects_out_of_range_reporting_id() {
        let config = PrefGuardConfig {
            reporting_ids_count: Some(2),
            tracked: vec![TrackedPreferenceMetadata::new("a", 5, EnforcementLevel::Enforce)],
            seed: generate_seed(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReportingIdOutOfRange { id: 5, count: 2, .. })
        ));
    }

    #[test]
    fn rejects_empty_seed() {
        let config = PrefGuardConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingSeed)));

        let blank = PrefGuardConfig {
            seed: "   ".into(),
            ..Default::default()
        };
        assert!(matches!(blank.validate(), Err(ConfigError::MissingSeed)));
    }

    #[test]
    fn seedless_file_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefguard.json");
        fs::write(&path, br#"{"seed": ""}"#).unwrap();
        assert!(matches!(
            PrefGuardConfig::load(&path),
            Err(ConfigError::MissingSeed)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefguard.json");
        let config = PrefGuardConfig {
            seed: generate_seed(),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rejects_bad_seed() {
        let config = PrefGuardConfig {
            seed: "not-hex".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSeed(_))));
    }
}
