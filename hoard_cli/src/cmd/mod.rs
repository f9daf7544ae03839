use std::path::{Path, PathBuf};

use anyhow::Result;
use hoard_node::NodeConfig;

use crate::Commands;

mod data;

pub use data::{run_get, run_put};

pub async fn run_command(
    node_config_file: PathBuf,
    local_data_dir: &Path,
    cmd: Commands,
) -> Result<()> {
    match cmd {
        Commands::Config { cmd } => {
            cmd.run(node_config_file, local_data_dir)?;
            Ok(())
        }
        Commands::Keygen => {
            println!("{}", hex::encode(hoard_core::generate_key()));
            Ok(())
        }
        Commands::Start => {
            let config = NodeConfig::load(&node_config_file)?;
            hoard_node::run_node(node_config_file, config).await?;
            Ok(())
        }
        Commands::Put { key, path } => run_put(&node_config_file, &key, &path).await,
        Commands::Get { key, out } => run_get(&node_config_file, &key, out.as_deref()).await,
    }
}
