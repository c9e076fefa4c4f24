//! Command implementations for the segdex CLI.

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::error::{Result, SegdexError};
use crate::index::check::CheckIndex;
use crate::index::config::OpenMode;
use crate::index::deletion_policy::KeepOnlyLastCommitDeletionPolicy;
use crate::index::reader::DirectoryReader;
use crate::index::snapshot::{PersistentSnapshotDeletionPolicy, SnapshotRegistry};
use crate::storage::{Storage, StorageConfig, StorageFactory};
use crate::storage::file::FileStorageConfig;

/// Execute a CLI command.
pub fn execute_command(args: SegdexArgs) -> Result<()> {
    match &args.command {
        Command::Check(check_args) => check_index(check_args, &args),
        Command::Commits(commits_args) => list_commits(commits_args, &args),
        Command::Snapshots(snapshots_args) => list_snapshots(snapshots_args, &args),
    }
}

fn open_storage(path: &Path) -> Result<Arc<dyn Storage>> {
    if !path.is_dir() {
        return Err(SegdexError::index_not_found(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    debug!("opening {}", path.display());
    StorageFactory::create(StorageConfig::File(FileStorageConfig::new(path)))
}

fn check_index(args: &CheckArgs, cli_args: &SegdexArgs) -> Result<()> {
    let storage = open_storage(&args.index_path)?;
    let mut checker = CheckIndex::new(storage);
    if !args.segments.is_empty() {
        checker = checker.with_segments(args.segments.iter().cloned());
    }
    let status = checker.check_index()?;

    let fixed_generation = if args.fix && !status.clean && !status.missing_segments {
        Some(checker.fix_index(&status)?)
    } else {
        None
    };
    let clean = status.clean;
    print_check(&CheckReport { status, fixed_generation }, cli_args, args.json)?;

    if clean || fixed_generation.is_some() {
        Ok(())
    } else {
        Err(SegdexError::corrupt("index has problems"))
    }
}

fn list_commits(args: &CommitsArgs, cli_args: &SegdexArgs) -> Result<()> {
    let storage = open_storage(&args.index_path)?;
    let commits: Vec<CommitSummary> = DirectoryReader::list_commits(storage.as_ref())?
        .into_iter()
        .map(|commit| CommitSummary {
            generation: commit.generation(),
            segments_file: commit.segments_file_name().to_string(),
            segments: commit.segment_count(),
            docs: commit.num_docs(),
            files: commit.file_names().len(),
            user_data: commit.user_data().clone(),
        })
        .collect();
    print_commits(&commits, cli_args)
}

fn list_snapshots(args: &SnapshotsArgs, cli_args: &SegdexArgs) -> Result<()> {
    let storage = open_storage(&args.index_path)?;
    let policy = PersistentSnapshotDeletionPolicy::new(
        Arc::new(KeepOnlyLastCommitDeletionPolicy),
        storage,
        OpenMode::Append,
    )?;
    print_snapshots(&policy.list_snapshots(), cli_args)
}
