//! transcache - persistent transformation cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use transcache::cli::{commands, Cli, Commands};
use transcache::config::ConfigManager;
use transcache::error::TranscacheResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  {} {}", style("caused by:").dim(), cause);
                source = cause.source();
            }
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> TranscacheResult<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);

    match cli.command {
        Commands::Build(args) => commands::build(args, &config).await,
        Commands::Check(args) => commands::check(args, &config).await,
        Commands::Keys(args) => commands::keys(args, &config).await,
        Commands::Show(args) => commands::show(args, &config).await,
        Commands::Clear(args) => commands::clear(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &manager).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; RUST_LOG wins when set
fn init_logging(verbose: u8, format: &str) {
    let level = match verbose {
        0 => "transcache=warn",
        1 => "transcache=info",
        _ => "transcache=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
