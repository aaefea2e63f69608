//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Default declaration file looked up in the current directory
pub const DEFAULT_DECLARATION: &str = "imgdeps.yaml";

/// imgdeps - incremental container image layer builder
///
/// Builds an image as a chain of single-purpose layers and reuses every
/// cached layer whose content and ancestry are unchanged.
#[derive(Parser, Debug)]
#[command(name = "imgdeps")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Settings file path
    #[arg(short, long, global = true, env = "IMGDEPS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a declaration, reusing cached layers
    Build(BuildArgs),

    /// Show the reuse plan for a declaration without building
    Plan(PlanArgs),

    /// Show the cached layer tree
    Layers(LayersArgs),

    /// Evict layers unused for a number of days
    Clean(CleanArgs),

    /// Save a built image to an archive
    Export(ExportArgs),

    /// Push every layer of a tracked chain to the configured tiers
    Push(PushArgs),

    /// Write an example declaration
    Init(InitArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Declaration file (YAML, or JSON by extension)
    #[arg(default_value = DEFAULT_DECLARATION)]
    pub declaration: PathBuf,

    /// Rebuild every layer, ignoring the cache
    #[arg(short, long)]
    pub force: bool,

    /// Remove a leftover cache lock before starting
    #[arg(long)]
    pub break_lock: bool,

    /// Extra build args (KEY=VALUE); not part of layer identity
    #[arg(short = 'a', long = "build-arg", value_parser = parse_key_value)]
    pub build_args: Vec<(String, String)>,

    /// Print the build report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Declaration file (YAML, or JSON by extension)
    #[arg(default_value = DEFAULT_DECLARATION)]
    pub declaration: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct LayersArgs {
    /// Only show the chain tracked for this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct CleanArgs {
    /// Evict layers unused for more than N days
    #[arg(long, default_value = "30")]
    pub older_than: u32,

    /// Show what would be removed
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Remove a leftover cache lock before starting
    #[arg(long)]
    pub break_lock: bool,
}

#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Output tag, `image_name:image_tag`
    pub target: String,

    /// Archive to write
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Output tag, `image_name:image_tag`
    pub target: String,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing declaration
    #[arg(short, long)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Parse `KEY=VALUE`
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
