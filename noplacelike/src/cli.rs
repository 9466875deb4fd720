use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "noplacelike",
    version,
    about = "LAN-local distributed resource-sharing platform"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the platform
    Serve {
        /// Bind address, overriding the configured host
        #[arg(long)]
        host: Option<String>,
        /// HTTP port, overriding the configured port
        #[arg(long)]
        port: Option<u16>,
        /// Path to the configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the version
    Version,
    /// Edit the configuration file
    Config {
        /// Add a directory to the shared list
        #[arg(long)]
        add_dir: Option<String>,
        /// Clear the shared directory list
        #[arg(long)]
        clear_dirs: bool,
        /// Path to the configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
