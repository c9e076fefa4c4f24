//! segdex CLI binary.

use std::process;

use clap::Parser;
use segdex::cli::{args::SegdexArgs, commands::execute_command};

fn main() {
    let args = SegdexArgs::parse();

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(args.log_level())
        .format_timestamp_millis()
        .init();

    if let Err(e) = execute_command(args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
