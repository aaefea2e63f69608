//! imgdeps - incremental container image layer builder
//!
//! CLI entry point that dispatches to subcommands.

use clap::{CommandFactory, Parser};
use console::style;
use imgdeps::cli::{Cli, Commands};
use imgdeps::config::{Config, ConfigManager};
use imgdeps::error::ImgdepsResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ImgdepsResult<()> {
    let cli = Cli::parse();

    // Commands that need no settings
    match cli.command {
        Commands::Completions { shell } => {
            init_logging(cli.verbose, "text");
            clap_complete::generate(shell, &mut Cli::command(), "imgdeps", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init(args) => {
            init_logging(cli.verbose, "text");
            return imgdeps::cli::commands::init(args).await;
        }
        _ => {}
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;
    init_logging(cli.verbose, &config.general.log_format);
    imgdeps::ui::init_theme();

    ConfigManager::ensure_dirs(&config).await?;
    dispatch(cli.command, &config).await
}

async fn dispatch(command: Commands, config: &Config) -> ImgdepsResult<()> {
    use imgdeps::cli::commands;

    match command {
        Commands::Build(args) => commands::build(args, config).await,
        Commands::Plan(args) => commands::plan(args, config).await,
        Commands::Layers(args) => commands::layers(args, config).await,
        Commands::Clean(args) => commands::clean(args, config).await,
        Commands::Export(args) => commands::export(args, config).await,
        Commands::Push(args) => commands::push(args, config).await,
        Commands::Init(args) => commands::init(args).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// 0 = warn (progress output only), 1 = info, 2+ = debug.
/// `RUST_LOG` wins when set.
fn init_logging(verbose: u8, format: &str) {
    let level = match verbose {
        0 => "imgdeps=warn",
        1 => "imgdeps=info",
        _ => "imgdeps=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}
