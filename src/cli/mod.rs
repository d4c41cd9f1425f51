//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Health probes and server metadata
//! - Model metadata, configuration and statistics
//! - Repository control (index, load, unload)
//! - Shared-memory status

pub mod handlers;

use crate::config::Args;
use clap::{Parser, Subcommand};

pub use handlers::run;

#[derive(Debug, Parser)]
#[command(author, version, about = "Command-line client for KServe v2 / Triton inference servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub args: Args,

    /// Verbosity level (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check whether the server is live
    Live,

    /// Check whether the server is ready
    Ready,

    /// Print server name, version and extensions
    ServerMetadata,

    /// Print a model's inputs and outputs
    ModelMetadata {
        /// Model name
        name: String,

        /// Model version (latest when omitted)
        #[arg(long)]
        model_version: Option<String>,
    },

    /// Print a model's configuration
    ModelConfig {
        /// Model name
        name: String,

        /// Model version (latest when omitted)
        #[arg(long)]
        model_version: Option<String>,
    },

    /// Print inference statistics
    ModelStats {
        /// Model name (all models when omitted)
        name: Option<String>,

        /// Model version
        #[arg(long)]
        model_version: Option<String>,
    },

    /// List the models in the repository
    Index {
        /// Repository name
        #[arg(long)]
        repository: Option<String>,

        /// Only list models that are ready
        #[arg(long)]
        ready: bool,
    },

    /// Load or reload a model
    Load {
        /// Model name
        name: String,
    },

    /// Unload a model
    Unload {
        /// Model name
        name: String,
    },

    /// Print registered system shared-memory regions
    ShmStatus {
        /// Region name (all regions when omitted)
        name: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_options() {
        let cli = Cli::parse_from([
            "tritonstream",
            "model-config",
            "densenet",
            "--model-version",
            "2",
            "--url",
            "triton:8001",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.args.url.as_deref(), Some("triton:8001"));
        match cli.command {
            Commands::ModelConfig { name, model_version } => {
                assert_eq!(name, "densenet");
                assert_eq!(model_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_flags() {
        let cli = Cli::parse_from(["tritonstream", "index", "--ready"]);
        match cli.command {
            Commands::Index { repository, ready } => {
                assert!(repository.is_none());
                assert!(ready);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
