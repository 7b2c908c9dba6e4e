//! Command-line arguments.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "chanrelay", version, about = "Relay messages between chat channels")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CHANRELAY_CONFIG", default_value = "chanrelay.toml")]
    pub config: PathBuf,

    /// Directory for message mappings and pause state
    #[arg(long, env = "CHANRELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate: bool,
}

/// `$XDG_DATA_HOME/chanrelay` (or the platform equivalent).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chanrelay")
}
