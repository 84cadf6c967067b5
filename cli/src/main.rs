// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use anyhow::Result;

fn run() -> Result<()> {
    linglong_utils::initialize_tracing();
    tracing::trace!("starting");
    linglong_lib::cli::run_from_iter(std::env::args_os())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
