use std::process::ExitCode;

use now_playing_sync::{Settings, SyncEngine};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Initializes the tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    info!(
        "starting {}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    debug!(?settings, "Loaded settings");

    let engine = match SyncEngine::new(&settings) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to build sync engine");
            return ExitCode::FAILURE;
        }
    };

    engine.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("shutting down gracefully");

    match engine.stop().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Poll loop did not stop cleanly");
            ExitCode::FAILURE
        }
    }
}
