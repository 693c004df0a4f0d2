//! Common error types for evsyn
//!
//! Shared infrastructure only: reading and writing the TOML config and
//! building clients from it. Pipeline and run failures live in the service
//! crate.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for evsyn operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Config file could not be read, or its directory created or replaced
    #[error("Config file {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for `TomlConfig`
    #[error("Config file {} is not valid: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config could not be serialized: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// A config value outside its accepted range
    #[error("Invalid config value: {0}")]
    InvalidValue(String),

    /// Inference client could not be built from the `[inference]` section
    #[error("Inference client setup failed: {0}")]
    InferenceSetup(String),
}

impl Error {
    pub(crate) fn config_io(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        }
    }
}
