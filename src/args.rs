use std::path::PathBuf;

use clap::Parser;

/// Automated host scanning with configurable tools
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// IP address of target
    #[arg(long, required_unless_present = "remove_host")]
    pub ip: Option<String>,

    /// Hostname for the hosts file
    #[arg(long)]
    pub hostname: String,

    /// Path to configuration file
    #[arg(short, long, default_value = "./config.yaml")]
    pub config: PathBuf,

    /// Output directory for results
    #[arg(short, long, required_unless_present = "remove_host")]
    pub output_dir: Option<PathBuf>,

    /// Skip updating the hosts file
    #[arg(short, long, default_value_t = false)]
    pub skip_hosts: bool,

    /// Enable debug logging with detailed error information
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Per-tool timeout in seconds, overrides the config file
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Remove the hostname's hosts entry and exit
    #[arg(long, default_value_t = false, conflicts_with_all = ["ip", "skip_hosts"])]
    pub remove_host: bool,
}
