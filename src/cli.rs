//! Argument parsing for both binaries (spec.md §6, SPEC_FULL.md A2).
//! Grounded on `cli/mod.rs` in the codebase this crate is grounded on,
//! generalized from a single `--config`/`--print-debug-info` pair to the
//! roster-file-or-`--exec` duality of spec.md §6.

use clap::{Parser, Subcommand};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/daemonshepherd/control";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML roster file. When omitted, the roster is built
    /// entirely from `--exec` flags (spec.md §6 "Simplified roster").
    #[arg(short, long)]
    pub config: Option<String>,

    #[arg(long, default_value_t = DEFAULT_SOCKET_PATH.to_string())]
    pub socket: String,

    /// `NAME=COMMAND`, repeatable. Merged with `--config` if both given.
    #[arg(long = "exec", value_parser = parse_exec)]
    pub execs: Vec<(String, String)>,

    #[arg(long)]
    pub print_debug_info: bool,
}

impl Cli {
    pub fn init() -> Self {
        Self::parse()
    }
}

fn parse_exec(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, command)| (name.to_string(), command.to_string()))
        .ok_or_else(|| format!("expected NAME=COMMAND, got `{raw}`"))
}

/// `shepherdctl`'s argument shape: a single request to send to the
/// control socket and print the reply of (spec.md §4.6, §6).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ClientCli {
    #[arg(long, default_value_t = DEFAULT_SOCKET_PATH.to_string())]
    pub socket: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    Reload,
    Ps,
    Start { daemon: String },
    Stop { daemon: String },
    Restart { daemon: String },
    CancelRestart { daemon: String },
    ListCommands { daemon: String },
    AdminCommand { daemon: String, admin_command: String },
}
