//! The main entrypoint for ostree-toolbox, which just performs global initialization, and then
//! calls out into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    ostree_toolbox_utils::initialize_tracing();
    tracing::trace!("starting");
    ostree_toolbox_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
