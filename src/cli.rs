use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogSink;

#[derive(Parser)]
#[command(
    name = "sshtunnel",
    about = "Run and inspect the SSH tunnels described in a config file",
    version
)]
pub struct Cli {
    /// Tunnel config file (default: sshtunnel.conf)
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log destination: stderr, stdout or a file path
    #[arg(long, short, global = true, value_name = "SINK")]
    pub log: Option<LogSink>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show tunnels with their process and systemd state
    #[command(alias = "ls")]
    Status {
        /// Tunnel, group or server names, or server addresses
        #[arg(value_name = "TUNNEL")]
        tunnels: Vec<String>,
    },
    /// Show the resolved configuration of tunnels
    Config {
        /// Tunnel, group or server names, or server addresses
        #[arg(value_name = "TUNNEL")]
        tunnels: Vec<String>,
    },
    /// Check that ssh can reach each tunnel's server
    Check {
        /// Tunnel, group or server names, or server addresses
        #[arg(value_name = "TUNNEL")]
        tunnels: Vec<String>,
    },
    /// Run tunnels until one of them dies or an interrupt arrives
    Run {
        /// Run every configured tunnel
        #[arg(long, short, conflicts_with = "tunnels")]
        all: bool,
        /// Tunnel, group or server names, or server addresses
        #[arg(value_name = "TUNNEL", required_unless_present = "all")]
        tunnels: Vec<String>,
    },
}
