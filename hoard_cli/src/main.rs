use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use std::path::PathBuf;

mod cmd;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// which hoard node this command should run on
    #[arg(short, long, value_name = "NAME", default_value = "local")]
    node: String,

    /// use this config file instead of the one of `--node`
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the node's config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Start the node and serve until Ctrl-C
    Start,
    /// Store a local file under a key and replicate it to the bootstrap peers
    Put {
        key: String,
        /// File whose content is stored
        path: PathBuf,
    },
    /// Fetch the content of a key, from local disk or from the network
    Get {
        key: String,
        /// Write the content to this file instead of stdout
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Print a fresh random network key as hex
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    // - Configs under:  ~/.config/hoard/
    //   - Default node: ~/.config/hoard/local.toml
    //   - Other nodes:  ~/.config/hoard/nodes/<name>.toml
    // - Data under:     ~/.local/share/hoard/<name>/
    let dirs =
        ProjectDirs::from("", "", "hoard").context("failed to determine config directory path")?;

    let node_config_file = match cli.config {
        Some(path) => path,
        None if cli.node == "local" => dirs.config_dir().join("local.toml"),
        None => dirs
            .config_dir()
            .join("nodes")
            .join(&cli.node)
            .with_extension("toml"),
    };

    let local_data_dir = dirs.data_dir().join(&cli.node);

    cmd::run_command(node_config_file, &local_data_dir, cli.cmd).await
}
