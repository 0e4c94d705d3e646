//! Server configuration, read from `config.toml` in the base directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use data_encoding::HEXLOWER;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("could not parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("encryption-key must be 64 hex characters")]
    BadKey,
}

fn default_listen_net() -> String {
    "tcp".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:5640".to_string()
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_snapshot_frequency() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Transport family for the 9P listener, `tcp` or `unix`.
    #[serde(default = "default_listen_net")]
    pub listen_net: String,

    /// Endpoint for the 9P listener: `host:port`, or a socket path.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Bytes per content block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// 64 hex characters; the AES-256-GCM key for blocks at rest.
    pub encryption_key: String,

    /// Where the remote store lives, e.g. `disk:///backup/muscle` or
    /// `memory://`.
    pub remote_store: String,

    staging_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    propagation_log: Option<PathBuf>,

    #[serde(default = "default_snapshot_frequency")]
    snapshot_frequency_seconds: u64,

    #[serde(skip)]
    base: PathBuf,
}

impl Config {
    pub fn load(base: &Path) -> Result<Self, Error> {
        let path = base.join("config.toml");
        let text = std::fs::read_to_string(&path).map_err(|e| Error::Read(path.clone(), e))?;
        let mut cfg: Config = toml::from_str(&text).map_err(|e| Error::Parse(path, e))?;
        cfg.base = base.to_path_buf();
        Ok(cfg)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn staging_dir_path(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.base.join("staging"))
    }

    pub fn cache_dir_path(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.base.join("cache"))
    }

    pub fn propagation_log_path(&self) -> PathBuf {
        self.propagation_log
            .clone()
            .unwrap_or_else(|| self.base.join("propagation.log"))
    }

    pub fn encryption_key_bytes(&self) -> Result<[u8; 32], Error> {
        let raw = HEXLOWER
            .decode(self.encryption_key.as_bytes())
            .map_err(|_| Error::BadKey)?;
        raw.try_into().map_err(|_| Error::BadKey)
    }

    pub fn snapshot_frequency(&self) -> Duration {
        Duration::from_secs(self.snapshot_frequency_seconds)
    }
}
