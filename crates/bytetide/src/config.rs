use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::Error;

/// Largest registry a node may be configured with.
pub const MAX_PEERS_LIMIT: usize = 2048;

/// Node configuration, read from a TOML file.
///
/// ```toml
/// directory = "/var/lib/btide"
/// max_peers = 16
/// port = 8080
/// ```
///
/// Unknown keys and duplicated keys are rejected.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where package files are stored, manifest filenames resolve here.
    pub directory: PathBuf,
    /// Capacity of the peer registry.
    pub max_peers: usize,
    /// TCP port of the listener.
    pub port: u16,
}

impl Config {
    /// Read, validate and prepare the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or parsed, if a value is out of range,
    /// or if the storage directory can't be created.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .map_err(|_| Error::FileOpen(path.to_path_buf()))?;

        let config = Self::parse(&text)?;
        config.prepare_directory().await?;

        debug!("loaded config from {path:?}: {config:?}");

        Ok(config)
    }

    /// Parse and validate without touching the filesystem.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.port <= 1024 {
            return Err(Error::Config(format!(
                "port must be in (1024, 65535], got {}",
                self.port
            )));
        }
        if !(1..=MAX_PEERS_LIMIT).contains(&self.max_peers) {
            return Err(Error::Config(format!(
                "max_peers must be in 1..={MAX_PEERS_LIMIT}, got {}",
                self.max_peers
            )));
        }
        Ok(())
    }

    /// Create the storage directory if it is missing.
    pub async fn prepare_directory(&self) -> Result<(), Error> {
        match fs::metadata(&self.directory).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::StorageDirectory(self.directory.clone())),
            Err(_) => fs::create_dir_all(&self.directory)
                .await
                .map_err(|_| Error::StorageDirectory(self.directory.clone())),
        }
    }
}
