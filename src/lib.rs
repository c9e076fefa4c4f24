//! # segdex
//!
//! A segmented, append-mostly document index in the style of Lucene's
//! `IndexWriter`.
//!
//! ## Features
//!
//! - Immutable segments written by flushes and combined by background merges
//! - Crash-safe two-phase commits (`pending_segments_N` renamed to `segments_N`)
//! - Reference-counted file deletion with pluggable deletion policies
//! - In-memory and persistent snapshots pinning old commits
//! - Near-real-time readers over uncommitted changes
//! - Pluggable storage backends, including a fault-injecting in-memory one

pub mod cli;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
