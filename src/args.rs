//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

/// Persistent terminal sessions over per-user Unix sockets.
///
/// A per-session daemon owns a PTY running your shell; any number of
/// clients can attach, detach with Ctrl+\, and reattach later. Session
/// discovery works through socket files under a per-user directory, so
/// no server process beyond the sessions themselves is needed.
#[derive(Debug, Parser)]
#[command(name = "sesh", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a detached session (daemonizes)
    Create {
        /// Session name ([A-Za-z0-9._-], max 64 bytes)
        name: String,
        /// Command to run in the session, after `--` (default: login shell)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Attach to a running session (detach with Ctrl+\)
    Attach {
        /// Session name
        name: String,
    },

    /// Attach to a session, creating it first if needed
    Open {
        /// Session name
        name: String,
        /// Command to run when the session is created, after `--`
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List live sessions
    List {
        /// Machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Report host and session telemetry
    Info {
        /// Machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Terminate a session's daemon and shell
    Kill {
        /// Session name
        name: String,
    },

    /// Print version information
    Version,
}

/// Join the words after `--` into the command string handed to the
/// session shell's `-c`.
pub fn join_command(words: &[String]) -> Option<String> {
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_create_parses_trailing_command() {
        let cli = Cli::parse_from(["sesh", "create", "build", "--", "cargo", "watch", "-x", "test"]);
        match cli.command {
            Commands::Create { name, command } => {
                assert_eq!(name, "build");
                assert_eq!(command, vec!["cargo", "watch", "-x", "test"]);
                assert_eq!(
                    join_command(&command).as_deref(),
                    Some("cargo watch -x test")
                );
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_create_without_command() {
        let cli = Cli::parse_from(["sesh", "create", "plain"]);
        match cli.command {
            Commands::Create { name, command } => {
                assert_eq!(name, "plain");
                assert!(command.is_empty());
                assert_eq!(join_command(&command), None);
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_list_json_flag() {
        let cli = Cli::parse_from(["sesh", "list", "--json"]);
        match cli.command {
            Commands::List { json } => assert!(json),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_name_is_an_error() {
        assert!(Cli::try_parse_from(["sesh", "create"]).is_err());
        assert!(Cli::try_parse_from(["sesh", "attach"]).is_err());
        assert!(Cli::try_parse_from(["sesh", "kill"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["sesh", "frobnicate"]).is_err());
    }
}
