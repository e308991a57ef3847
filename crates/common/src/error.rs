// Error types for tunnel9

use std::path::PathBuf;

use thiserror::Error;

use crate::types::TunnelId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid tunnel '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Duplicate tunnel id: {0}")]
    DuplicateId(TunnelId),

    #[error("Unsupported config version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
