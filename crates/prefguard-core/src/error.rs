use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PrefStoreError {
    #[error("cannot create profile directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize preferences to {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },
    #[error("preferences at {path} are not loaded yet")]
    NotLoaded { path: PathBuf },
    #[error("preferences at {path} are read-only after a failed read")]
    ReadOnly { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no seed configured")]
    MissingSeed,
    #[error("seed is not valid hex: {0}")]
    InvalidSeed(#[from] hex::FromHexError),
    #[error("preference tracked twice: {0}")]
    DuplicateName(String),
    #[error("reporting id {0} assigned to more than one preference")]
    DuplicateReportingId(usize),
    #[error("reporting id {id} of {name} is outside 0..{count}")]
    ReportingIdOutOfRange {
        name: String,
        id: usize,
        count: usize,
    },
}
