use std::{io::Write, path::Path};

use anyhow::{Context, Result, bail};
use hoard_node::{FileServer, NodeConfig};
use tracing::info;

/// Starts a short-lived node on an ephemeral port that shares storage, key
/// and bootstrap peers with the configured node.
async fn start_oneshot_node(node_config_file: &Path) -> Result<FileServer> {
    let config = NodeConfig::load(node_config_file)?;
    let config_dir = node_config_file
        .parent()
        .context("config file has no parent directory")?;
    let mut opts = config.to_server_opts(config_dir)?;
    if opts.encryption_key.is_none() {
        bail!("no network key configured, run `hoard config init` first");
    }
    // the configured address belongs to `hoard start`
    opts.listen_addr = "127.0.0.1:0".to_owned();

    let server = FileServer::new(opts);
    server.start().await?;
    info!("connected to {} peers", server.peer_addrs().len());
    Ok(server)
}

pub async fn run_put(node_config_file: &Path, key: &str, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let server = start_oneshot_node(node_config_file).await?;
    let peers = server.peer_addrs().len();
    let stored = server.store(key, &mut file).await;
    server.stop().await;

    let size = stored.with_context(|| format!("failed to store '{key}'"))?;
    println!("stored '{key}' ({size} bytes encrypted), sent to {peers} peers");
    Ok(())
}

pub async fn run_get(node_config_file: &Path, key: &str, out: Option<&Path>) -> Result<()> {
    let server = start_oneshot_node(node_config_file).await?;
    let fetched = server.get(key).await;
    server.stop().await;

    let data = fetched
        .with_context(|| format!("failed to get '{key}'"))?
        .into_inner();
    match out {
        Some(out) => {
            tokio::fs::write(out, &data)
                .await
                .with_context(|| format!("failed to write to {}", out.display()))?;
            println!("wrote {} bytes to {}", data.len(), out.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
