//! sesh: persistent terminal sessions over per-user Unix sockets.
//!
//! One binary, several modes selected by subcommand:
//!   sesh create <name> [-- cmd...]   daemonize a new session
//!   sesh attach <name>               attach to a running session
//!   sesh open <name> [-- cmd...]     attach, creating if needed
//!   sesh list [--json]               enumerate live sessions
//!   sesh info [--json]               host telemetry
//!   sesh kill <name>                 terminate a session
//!
//! `attach` exits with the session child's exit code, or 0 when the
//! user detached with Ctrl+\.

mod args;
mod client;
mod commands;
mod config;
mod log;
mod protocol;
mod pty;
mod registry;
mod server;
mod sysinfo;
mod terminal;

use clap::Parser;

use crate::args::{Cli, Commands};
use crate::config::Config;

fn main() {
    Config::init();

    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sesh: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Create { name, command } => {
            commands::create(&name, args::join_command(&command).as_deref())?;
            Ok(0)
        }
        Commands::Attach { name } => client::attach(&name),
        Commands::Open { name, command } => {
            commands::open(&name, args::join_command(&command).as_deref())
        }
        Commands::List { json } => {
            commands::list(json)?;
            Ok(0)
        }
        Commands::Info { json } => {
            sysinfo::info(json)?;
            Ok(0)
        }
        Commands::Kill { name } => {
            commands::kill_session(&name)?;
            Ok(0)
        }
        Commands::Version => {
            println!("sesh {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}
