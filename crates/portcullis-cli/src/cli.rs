//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Portcullis plugins - install, check and reset proxy plugins
#[derive(Parser)]
#[command(name = "portcullis-plugins")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Static configuration file (YAML, TOML or JSON)
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "PORTCULLIS_CONFIG",
        default_value = "portcullis.yml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download, verify and unpack the declared plugins, then load each one
    /// with its manifest test data
    Install {
        /// Skip loading the plugins after installation
        #[arg(long)]
        no_check: bool,
    },

    /// Print the module versions recorded by the last installation
    State,

    /// Delete every downloaded archive and extracted source tree
    Reset,
}
