use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Subcommand;
use toml_edit::{Array, DocumentMut, value};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates node config file if it doesn't exist and generates a network key
    Init {
        /// Address the node listens on
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:3000")]
        listen: String,
        /// Peer dialed on start, may be given multiple times
        #[arg(long, value_name = "ADDR")]
        bootstrap: Vec<String>,
    },
}

impl CmdConfig {
    pub fn run(self, node_config_file: PathBuf, local_data_dir: &Path) -> anyhow::Result<()> {
        let config_dir = node_config_file
            .parent()
            .context("config file has no parent directory")?;
        let mut doc = if node_config_file.exists() {
            fs::read_to_string(&node_config_file)?
        } else {
            fs::create_dir_all(config_dir)?;
            "".to_owned()
        }
        .parse::<DocumentMut>()
        .context("could not parse node config file")?;

        match self {
            Self::Init { listen, bootstrap } => {
                let key_file = node_config_file.with_extension("key");
                let key_file_name = key_file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .context("config file name is not valid UTF-8")?
                    .to_owned();
                let storage_root = local_data_dir.join("storage");
                let storage_root = storage_root
                    .to_str()
                    .context("data directory is not valid UTF-8")?;

                // existing settings are kept
                doc.entry("listen_addr").or_insert(value(listen));
                doc.entry("storage_root").or_insert(value(storage_root));
                doc.entry("encryption_key_file")
                    .or_insert(value(key_file_name));

                let peers = doc
                    .entry("bootstrap")
                    .or_insert(value(Array::new()))
                    .as_array_mut()
                    .context("bootstrap must be an array")?;
                for addr in bootstrap {
                    if !peers.iter().any(|peer| peer.as_str() == Some(addr.as_str())) {
                        peers.push(addr);
                    }
                }

                if !key_file.exists() {
                    info!("generating random network key for node");
                    fs::write(&key_file, hex::encode(hoard_core::generate_key()))?;
                }
            }
        }

        info!("writing to config file {node_config_file:?}");

        let tmp_path = node_config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, node_config_file)?;
        Ok(())
    }
}
