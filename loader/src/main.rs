#[cfg(windows)]
mod host;

use clap::Parser;
use logger::error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version)]
struct Args {
    input: PathBuf,

    /// Scatter the code across this many separately allocated regions.
    #[arg(short = 's', long = "split", default_value_t = 1)]
    split: usize,

    /// Call the rewritten entry point after mapping.
    #[arg(short = 'r', long = "run")]
    run: bool,
}

#[cfg(windows)]
fn main() {
    let args = Args::parse();

    if let Err(e) = host::map(&args) {
        error!("Rewrite failed in {:?} phase: {}", e.phase(), e);
        std::process::exit(1);
    }
}

#[cfg(not(windows))]
fn main() {
    let _ = Args::parse();
    error!("The loader needs a Windows host for allocation and import resolution");
    std::process::exit(1);
}
