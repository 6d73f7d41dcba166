//! CLI argument definitions using clap derive

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// transcache - persistent cache for rewritten code artifacts
///
/// Copies the artifacts of a set of load units, runs them through a
/// rewriter, and stores the result so unchanged inputs skip rewriting.
#[derive(Parser, Debug)]
#[command(name = "transcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TRANSCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reuse the transform cache or rebuild it
    Build(BuildArgs),

    /// Report whether the transform cache matches the inputs
    Check(CheckArgs),

    /// Print the cache keys the inputs produce
    Keys(KeysArgs),

    /// List the contents of the transform cache
    Show(ShowArgs),

    /// Delete the transform cache
    Clear(ClearArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Inputs shared by every command that reads a unit manifest
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Unit manifest (TOML) describing units and solved dependencies
    #[arg(short, long, env = "TRANSCACHE_UNITS")]
    pub units: PathBuf,

    /// Feature flag taking part in the cache key (NAME=true|false)
    #[arg(long = "flag", value_parser = parse_flag)]
    pub flags: Vec<(String, bool)>,
}

/// Cache folder override
#[derive(Args, Debug, Clone)]
pub struct CacheDirArgs {
    /// Transform cache folder (overrides cache.dir)
    #[arg(long, env = "TRANSCACHE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub dir: CacheDirArgs,

    /// List every changed key when the cache is invalidated
    #[arg(long)]
    pub log_changed_keys: bool,

    /// Rebuild even if the cache matches
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub dir: CacheDirArgs,
}

/// Arguments for the keys command
#[derive(Parser, Debug)]
pub struct KeysArgs {
    #[command(flatten)]
    pub input: InputArgs,
}

/// Arguments for the show command
#[derive(Parser, Debug)]
pub struct ShowArgs {
    #[command(flatten)]
    pub dir: CacheDirArgs,

    /// Only list files of this unit
    #[arg(long)]
    pub unit: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the clear command
#[derive(Parser, Debug)]
pub struct ClearArgs {
    #[command(flatten)]
    pub dir: CacheDirArgs,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.preload or transform.flags.name)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for show
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Plain,
}

/// Parse NAME=true|false
fn parse_flag(s: &str) -> Result<(String, bool), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid flag '{}': expected NAME=true|false", s))?;
    if name.is_empty() {
        return Err(format!("invalid flag '{}': empty name", s));
    }
    let value = match value {
        "true" => true,
        "false" => false,
        other => return Err(format!("invalid flag value '{}': expected true or false", other)),
    };
    Ok((name.to_string(), value))
}
