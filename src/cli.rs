//! Command line interface (clap v4 derive)

use clap::{Parser, Subcommand};

/// peerlink - peer discovery and messaging over a pub/sub bus
///
/// Runs a coordinator node that finds the other instances of a plugin on
/// the bus, tracks their liveness, and exchanges messages with them.
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a coordinator node until Ctrl+C
    Node {
        /// Path to configuration file
        #[arg(short, long, env = "PEERLINK_CONFIG")]
        config: Option<String>,

        /// Server identifier (overrides the configuration)
        #[arg(long)]
        server_id: Option<String>,

        /// Broker address (overrides the configuration)
        #[arg(long)]
        broker: Option<String>,

        /// Heartbeat rate in seconds, 0 disables it
        #[arg(long)]
        ping_rate: Option<u64>,

        /// Broadcast this text to all peers once running
        #[arg(long)]
        say: Option<String>,
    },

    /// Run the WebSocket relay broker
    Relay {
        /// Path to configuration file
        #[arg(short, long, env = "PEERLINK_CONFIG")]
        config: Option<String>,

        /// Listen address (overrides the configuration)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to create the file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_node_defaults() {
        let cli = Cli::parse_from(["peerlink", "node"]);
        match cli.command {
            Commands::Node { config, server_id, broker, ping_rate, say } => {
                assert!(config.is_none());
                assert!(server_id.is_none());
                assert!(broker.is_none());
                assert!(ping_rate.is_none());
                assert!(say.is_none());
            }
            _ => panic!("Expected Node command"),
        }
    }

    #[test]
    fn test_node_with_options() {
        let cli = Cli::parse_from([
            "peerlink",
            "node",
            "--server-id",
            "alpha",
            "--broker",
            "ws://127.0.0.1:7400",
            "--ping-rate",
            "30",
            "--say",
            "hello",
        ]);
        match cli.command {
            Commands::Node { server_id, broker, ping_rate, say, .. } => {
                assert_eq!(server_id.as_deref(), Some("alpha"));
                assert_eq!(broker.as_deref(), Some("ws://127.0.0.1:7400"));
                assert_eq!(ping_rate, Some(30));
                assert_eq!(say.as_deref(), Some("hello"));
            }
            _ => panic!("Expected Node command"),
        }
    }

    #[test]
    fn test_relay_listen() {
        let cli = Cli::parse_from(["peerlink", "relay", "--listen", "0.0.0.0:9000"]);
        match cli.command {
            Commands::Relay { listen, .. } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Relay command"),
        }
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::parse_from(["peerlink", "config", "init", "--path", "/tmp/p.toml", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert_eq!(path.as_deref(), Some("/tmp/p.toml"));
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["peerlink", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);

        let cli = Cli::parse_from(["peerlink", "version", "-q"]);
        assert!(cli.quiet);
    }
}
