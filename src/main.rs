//
// main.rs
// MedImg-Pipeline
//
// Tokio entry point: installs the tracing subscriber, then hands off to the CLI layer.
//
// Thales Matheus Mendonça Santos - November 2025

use medimg_pipeline::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    // Delegate all argument parsing and dispatching to the CLI module.
    cli::run().await
}

/// Logs go to stderr so JSON printed on stdout stays machine-readable. `RUST_LOG` overrides
/// the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
