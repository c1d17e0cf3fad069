//! Entrypoint of the CDC stream consumer.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use clap::Parser;
use observability_deps::tracing::error;
use tracing_subscriber::EnvFilter;

mod commands {
    pub mod run;
}

#[derive(Debug, Parser)]
#[command(
    name = "keyspaces_cdc",
    about = "Consumes a table's CDC stream and delivers change records to a configured sink",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the consumer until a shutdown signal arrives.
    Run(commands::run::Config),
}

fn init_logging() {
    // LOG_FILTER uses the standard env-filter syntax, e.g.
    // "info,lease_manager=debug".
    let filter = EnvFilter::try_from_env("LOG_FILTER")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    let result = match cli.command {
        Command::Run(config) => runtime.block_on(commands::run::command(config)),
    };

    if let Err(e) = result {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
