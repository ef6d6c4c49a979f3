//! CLI argument definitions for imagebump.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// imagebump - Keep pinned CI docker image digests up to date.
///
/// Start with `imagebump check` to validate the configuration, then
/// `imagebump run --dry-run` to see what would be proposed.
#[derive(Parser, Debug)]
#[command(name = "imagebump")]
#[command(author, version = crate::cli::VERSION, about = "Propose CI docker image digest bumps as pull requests", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Path to the configuration file (default: ./imagebump.toml).
    /// Can also be set via IMAGEBUMP_CONFIG environment variable.
    #[arg(short = 'c', long = "config", global = true, env = "IMAGEBUMP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log debug output (overridden by RUST_LOG)
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Log line format on stderr
    #[arg(long = "log-format", global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Version string including the build commit when known.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("IMAGEBUMP_GIT_COMMIT"),
    " ",
    env!("IMAGEBUMP_BUILD_TIMESTAMP"),
    ")"
);

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check every configured repository and propose digest updates
    ///
    /// Repositories are processed one after another. A failure in one does
    /// not stop the others; the exit code is non-zero if any failed.
    Run {
        /// Only process this repository (repeatable; default: all)
        #[arg(short = 'r', long = "repo")]
        repos: Vec<String>,

        /// Evaluate every gate but write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Known image digests and their review status
    Versions {
        #[command(subcommand)]
        command: VersionCommands,
    },

    /// Pull requests tracked per repository
    Prs {
        #[command(subcommand)]
        command: PrCommands,
    },

    /// Validate the configuration and show the resolved repositories
    Check {
        /// Also confirm the GitHub token works (GET /user)
        #[arg(long)]
        validate_token: bool,
    },
}

/// Version status subcommands
#[derive(Subcommand, Debug)]
pub enum VersionCommands {
    /// List known digests
    List,

    /// Set the review status of a digest
    Set {
        /// Image digest (sha256:<hex>)
        digest: String,

        /// unknown, verified, or blacklisted
        status: String,
    },

    /// Forget a digest
    Rm {
        /// Image digest (sha256:<hex>)
        digest: String,
    },
}

/// Pull request tracker subcommands
#[derive(Subcommand, Debug)]
pub enum PrCommands {
    /// List tracked pull requests
    List,

    /// Stop tracking the pull request of a repository
    Forget {
        /// GitHub repository (owner/name)
        repository: String,
    },
}
