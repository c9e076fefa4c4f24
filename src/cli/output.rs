//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, SegdexArgs};
use crate::error::Result;
use crate::index::check::CheckIndexStatus;
use crate::index::snapshot::Snapshot;

/// One row of `segdex commits`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitSummary {
    pub generation: u64,
    pub segments_file: String,
    pub segments: usize,
    pub docs: u64,
    pub files: usize,
    pub user_data: std::collections::BTreeMap<String, String>,
}

/// Result of `segdex check`.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub status: CheckIndexStatus,
    /// Generation written by `--fix`.
    pub fixed_generation: Option<u64>,
}

/// Print a serializable result in the selected format.
pub fn output_json<T: Serialize>(result: &T, args: &SegdexArgs) -> Result<()> {
    let text = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{text}");
    Ok(())
}

pub fn print_check(report: &CheckReport, args: &SegdexArgs, json: bool) -> Result<()> {
    if json || args.output_format == OutputFormat::Json {
        return output_json(report, args);
    }
    let status = &report.status;
    if status.missing_segments {
        println!("No readable commit found.");
        return Ok(());
    }
    println!(
        "{} (generation {}), {} segments",
        status.segments_file_name.as_deref().unwrap_or("-"),
        status.generation,
        status.num_segments
    );
    for segment in &status.segments {
        let verdict = match &segment.error {
            None => "OK".to_string(),
            Some(e) => format!("BROKEN: {e}"),
        };
        println!(
            "  {:<8} docs={:<8} deleted={:<6} terms={:<8} bytes={:<10} {}",
            segment.name,
            segment.doc_count,
            segment.del_count,
            segment.term_count,
            segment.size_bytes,
            verdict
        );
        if args.verbosity() > 1 {
            for (key, value) in &segment.diagnostics {
                println!("      {key}: {value}");
            }
        }
    }
    println!();
    if status.clean {
        println!(
            "No problems found: {} docs, {} terms, {} stored docs.",
            status.total_docs, status.term_count, status.stored_doc_count
        );
    } else {
        println!(
            "{} broken segments; {} docs would be lost by --fix.",
            status.broken_segments.len(),
            status.lost_docs
        );
    }
    if let Some(generation) = report.fixed_generation {
        println!("Wrote fixed commit at generation {generation}.");
    }
    Ok(())
}

pub fn print_commits(commits: &[CommitSummary], args: &SegdexArgs) -> Result<()> {
    if args.output_format == OutputFormat::Json {
        return output_json(&commits, args);
    }
    println!("{:<14} {:>10} {:>10} {:>8}", "commit", "segments", "docs", "files");
    for commit in commits {
        println!(
            "{:<14} {:>10} {:>10} {:>8}",
            commit.segments_file, commit.segments, commit.docs, commit.files
        );
        if args.verbosity() > 1 {
            for (key, value) in &commit.user_data {
                println!("    {key}={value}");
            }
        }
    }
    Ok(())
}

pub fn print_snapshots(snapshots: &[Snapshot], args: &SegdexArgs) -> Result<()> {
    if args.output_format == OutputFormat::Json {
        return output_json(&snapshots, args);
    }
    if snapshots.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }
    for snapshot in snapshots {
        println!(
            "{:<12} generation={:<6} created={}",
            snapshot.id,
            snapshot.generation,
            snapshot.created_at.to_rfc3339()
        );
    }
    Ok(())
}
