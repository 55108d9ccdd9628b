//! Binary entrypoint for `orca-server`.

use orca_common::config::RuntimeConfig;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = orca_server::app::run(RuntimeConfig::default()) {
        eprintln!("failed to start orca-server: {err}");
        std::process::exit(1);
    }
}
