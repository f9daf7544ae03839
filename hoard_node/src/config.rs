use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, bail};
use hoard_core::{PathTransform, hashed_path_transform, plain_path_transform};
use serde::{Deserialize, Serialize};

use crate::server::{DEFAULT_GET_TIMEOUT, DEFAULT_WRITE_TIMEOUT, FileServerOpts};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Relative paths are resolved against the config file's directory.
    pub storage_root: PathBuf,
    #[serde(default)]
    pub path_transform: PathTransformKind,
    /// Hex encoded network key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// File holding the network key, hex encoded or raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_file: Option<String>,
    #[serde(default)]
    pub network: NodeConfigNetwork,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PathTransformKind {
    #[default]
    Hashed,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigNetwork {
    #[serde(default = "default_get_timeout_ms")]
    pub get_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for NodeConfigNetwork {
    fn default() -> Self {
        Self {
            get_timeout_ms: default_get_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_get_timeout_ms() -> u64 {
    DEFAULT_GET_TIMEOUT.as_millis() as u64
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT.as_millis() as u64
}

impl PathTransformKind {
    pub fn transform(self) -> PathTransform {
        match self {
            PathTransformKind::Hashed => hashed_path_transform,
            PathTransformKind::Plain => plain_path_transform,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            bootstrap: Vec::new(),
            storage_root: storage_root.into(),
            path_transform: PathTransformKind::default(),
            encryption_key: None,
            encryption_key_file: None,
            network: NodeConfigNetwork::default(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Builds server options; relative paths are taken relative to `config_dir`.
    pub fn to_server_opts(&self, config_dir: &Path) -> anyhow::Result<FileServerOpts> {
        let mut opts = FileServerOpts::new(self.listen_addr.clone());
        opts.bootstrap_nodes = self.bootstrap.clone();
        opts.storage_root = config_dir.join(&self.storage_root);
        opts.path_transform = self.path_transform.transform();
        opts.encryption_key = self.encryption_key(config_dir)?;
        opts.get_timeout = Duration::from_millis(self.network.get_timeout_ms);
        opts.write_timeout = Duration::from_millis(self.network.write_timeout_ms);
        Ok(opts)
    }

    fn encryption_key(&self, config_dir: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        match (&self.encryption_key, &self.encryption_key_file) {
            (Some(_), Some(_)) => {
                bail!("set either encryption_key or encryption_key_file, not both")
            }
            (Some(key), None) => {
                let key = hex::decode(key.trim()).context("encryption_key is not valid hex")?;
                Ok(Some(key))
            }
            (None, Some(file)) => {
                let path = config_dir.join(file);
                let content = std::fs::read(&path)
                    .with_context(|| format!("failed to read key file {}", path.display()))?;
                Ok(Some(parse_key_file(&content)))
            }
            (None, None) => Ok(None),
        }
    }
}

/// A key file holds either hex text or the raw key bytes.
fn parse_key_file(content: &[u8]) -> Vec<u8> {
    std::str::from_utf8(content)
        .ok()
        .and_then(|text| hex::decode(text.trim()).ok())
        .unwrap_or_else(|| content.to_vec())
}
