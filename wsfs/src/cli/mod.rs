use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod server;

#[derive(Parser)]
#[command(name = "wsfs")]
#[command(author, version, about = "Filesystem engine for a remote FUSE driver", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "wsfs.toml")]
        path: PathBuf,
    },
    /// Run the filesystem server
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
