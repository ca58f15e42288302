//! The main entrypoint for rootsnap, the command line tool to deploy and
//! manage atomic root filesystem images.

use anyhow::Result;

fn run() -> Result<()> {
    rootsnap_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    rootsnap_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
