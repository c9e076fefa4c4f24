//! Command line argument parsing for the segdex CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// segdex - inspect and repair segment indexes
#[derive(Parser, Debug, Clone)]
#[command(name = "segdex")]
#[command(about = "Inspect and repair segdex indexes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct SegdexArgs {
    /// Verbosity level (repeat for more: -v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human", global = true)]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl SegdexArgs {
    /// Effective verbosity: 0 quiet, 1 normal, then one step per `-v`.
    pub fn verbosity(&self) -> u8 {
        if self.quiet { 0 } else { 1 + self.verbose }
    }

    /// Log filter matching the verbosity.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbosity() {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Verify every segment of the latest commit
    Check(CheckArgs),

    /// List the commits present in an index
    Commits(CommitsArgs),

    /// List persisted snapshots
    Snapshots(SnapshotsArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,

    /// Only check these segments (repeatable)
    #[arg(short, long = "segment", value_name = "NAME")]
    pub segments: Vec<String>,

    /// Commit a new generation without broken segments
    #[arg(long, conflicts_with = "segments")]
    pub fix: bool,

    /// Shorthand for --format json
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CommitsArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct SnapshotsArgs {
    /// Index directory
    #[arg(value_name = "INDEX_PATH")]
    pub index_path: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check() {
        let args = SegdexArgs::parse_from([
            "segdex", "-vv", "check", "/tmp/idx", "--segment", "_0", "--segment", "_3",
        ]);
        assert_eq!(args.verbosity(), 3);
        assert_eq!(args.log_level(), log::LevelFilter::Debug);
        match args.command {
            Command::Check(check) => {
                assert_eq!(check.index_path, PathBuf::from("/tmp/idx"));
                assert_eq!(check.segments, vec!["_0", "_3"]);
                assert!(!check.fix);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_fix_conflicts_with_segment() {
        let parsed =
            SegdexArgs::try_parse_from(["segdex", "check", "/tmp/idx", "--fix", "--segment", "_0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        let args = SegdexArgs::parse_from(["segdex", "-q", "-vvv", "-f", "json", "commits", "/x"]);
        assert_eq!(args.verbosity(), 0);
        assert_eq!(args.output_format, OutputFormat::Json);
    }
}
