use std::path::PathBuf;

use clap::Parser;

/// CLI flags of the node binary.
#[derive(Parser, Debug)]
#[clap(name = "btide")]
#[command(version, about = "ByteTide peer-to-peer node", long_about = None)]
pub(crate) struct Args {
    /// Path of the TOML configuration file.
    pub config: PathBuf,

    /// Log debug messages to stderr.
    #[clap(short, long)]
    pub verbose: bool,
}
