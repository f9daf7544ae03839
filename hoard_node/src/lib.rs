use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

pub mod config;
mod error;
pub mod message;
mod peers;
mod server;

pub use config::{NodeConfig, NodeConfigNetwork, PathTransformKind};
pub use error::ServerError;
pub use message::{GetFile, Message, StoreFile};
pub use peers::PeerTable;
pub use server::{DEFAULT_GET_TIMEOUT, DEFAULT_WRITE_TIMEOUT, FileServer, FileServerOpts};

/// Runs a node from its config file until Ctrl-C.
pub async fn run_node(config_file_path: PathBuf, config: NodeConfig) -> anyhow::Result<()> {
    let config_dir = config_file_path
        .parent()
        .context("config file has no parent directory")?;
    let server = FileServer::new(config.to_server_opts(config_dir)?);
    server.start().await?;

    if let Some(addr) = server.local_addr() {
        info!("node listening on {addr} with {} peers", server.peer_addrs().len());
    }

    tokio::signal::ctrl_c().await?;

    println!("Shutting down.");
    server.stop().await;

    Ok(())
}
