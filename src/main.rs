//! imagebump CLI - Keep pinned CI docker image digests up to date.

use clap::Parser;
use imagebump::cli::{Cli, Commands, LogFormat, PrCommands, VersionCommands};
use imagebump::commands::{self, Output};
use imagebump::config::Config;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    init_tracing(cli.verbose, cli.log_format);

    let result = run_command(cli.command, cli.config.as_deref(), human);

    match result {
        Ok(success) => {
            if !success {
                process::exit(1);
            }
        }
        Err(e) => {
            if human {
                eprintln!("Error: {}", e);
            } else {
                eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
            }
            process::exit(1);
        }
    }
}

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins over `-v`; without either only imagebump's info lines show.
fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "imagebump=debug"
    } else {
        "imagebump=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Execute a command; `Ok(false)` means it ran but some repository failed.
fn run_command(
    command: Commands,
    config_path: Option<&std::path::Path>,
    human: bool,
) -> imagebump::Result<bool> {
    let config = Config::load(&Config::locate(config_path))?;

    match command {
        Commands::Run { repos, dry_run } => {
            let report = commands::run(&config, &repos, dry_run)?;
            output(&report, human);
            Ok(!report.has_failures())
        }
        Commands::Versions { command } => {
            match command {
                VersionCommands::List => output(&commands::versions_list(&config.state_dir)?, human),
                VersionCommands::Set { digest, status } => output(
                    &commands::versions_set(&config.state_dir, &digest, &status)?,
                    human,
                ),
                VersionCommands::Rm { digest } => {
                    output(&commands::versions_rm(&config.state_dir, &digest)?, human)
                }
            }
            Ok(true)
        }
        Commands::Prs { command } => {
            match command {
                PrCommands::List => output(&commands::prs_list(&config.state_dir)?, human),
                PrCommands::Forget { repository } => {
                    output(&commands::prs_forget(&config.state_dir, &repository)?, human)
                }
            }
            Ok(true)
        }
        Commands::Check { validate_token } => {
            output(&commands::check(&config, validate_token)?, human);
            Ok(true)
        }
    }
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
