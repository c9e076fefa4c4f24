//! Command line interface for inspecting segdex indexes.

pub mod args;
pub mod commands;
pub mod output;

pub use args::SegdexArgs;
pub use commands::execute_command;
