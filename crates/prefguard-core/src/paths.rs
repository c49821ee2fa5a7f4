use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "prefguard";

pub const PREFERENCES_FILENAME: &str = "Preferences";
pub const LOCAL_STATE_FILENAME: &str = "Local State";
pub const CONFIG_FILENAME: &str = "prefguard.json";
pub const DEFAULT_PROFILE_DIR: &str = "Default";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("PREFGUARD_CONFIG") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine config directory"))?;
    Ok(dirs.config_dir().join(CONFIG_FILENAME))
}

pub fn local_state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCAL_STATE_FILENAME)
}

pub fn default_profile_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DEFAULT_PROFILE_DIR)
}

/// Location of the preferences file inside a profile directory.
pub fn pref_file_path(profile_path: &Path) -> PathBuf {
    profile_path.join(PREFERENCES_FILENAME)
}
