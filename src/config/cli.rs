use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::cache::DEFAULT_REGION;

/// Command-line arguments for the cachet binary.
#[derive(Debug, Parser)]
#[command(name = "cachet", version, about = "Validity-aware content cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHET_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Open all regions and run the refresh scheduler until interrupted.
    Run(RunArgs),
    /// List the keys held by a region.
    Keys(RegionArgs),
    /// Remove every entry from a region.
    Clear(RegionArgs),
    /// Push-invalidate every entry tagged with an event name.
    Event(EventArgs),
    /// Run each configured refresh job once and exit.
    Refresh(RunArgs),
}

impl Command {
    pub fn overrides(&self) -> &Overrides {
        match self {
            Self::Run(args) | Self::Refresh(args) => &args.overrides,
            Self::Keys(args) | Self::Clear(args) => &args.overrides,
            Self::Event(args) => &args.target.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory relative region directories resolve against.
    #[arg(long = "store-work-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub store_work_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Clone)]
pub struct RegionArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Region to operate on.
    #[arg(long, value_name = "NAME", default_value = DEFAULT_REGION)]
    pub region: String,
}

#[derive(Debug, Args, Clone)]
pub struct EventArgs {
    #[command(flatten)]
    pub target: RegionArgs,

    /// Event name; entries tagged with it are removed.
    #[arg(value_name = "NAME")]
    pub name: Option<String>,
}
