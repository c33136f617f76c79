//! Product service example application
//!
//! Reads `EVENTBUS_*` settings from the environment, installs telemetry,
//! consumes `ProductCreated` events into a catalog and exits once the sample
//! event has been processed or Ctrl-C is pressed.
//!
//! Exit codes: 0 after a graceful shutdown, 2 on invalid configuration,
//! 1 on any other startup failure.

use std::process::ExitCode;
use std::time::Duration;

use eventrelay::config::EnvSource;
use eventrelay::logging::{self, LoggingSettings};
use eventrelay::telemetry::{TelemetryPipelineBuilder, TelemetrySettings};
use eventrelay::BusSettings;
use eventrelay_examples::product_service::{self, catalog::Catalog};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let source = EnvSource;
    let settings = match BusSettings::load(&source) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("product_service: {error}");
            return ExitCode::from(2);
        }
    };

    let telemetry = TelemetrySettings::load(&source, product_service::SERVICE_NAME);
    let pipeline = TelemetryPipelineBuilder::from_settings(&telemetry).install();
    if !logging::init(&LoggingSettings::load(&source), Some(&pipeline)) {
        eprintln!("product_service: a global tracing subscriber was already installed");
    }
    let flushing = CancellationToken::new();
    let flusher = pipeline.spawn_periodic_flush(FLUSH_INTERVAL, flushing.clone());

    info!(service = %telemetry.service_name, "starting");
    let broker = product_service::broker_for(&settings);
    let stop = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let result = product_service::run(&settings, broker, &pipeline, Catalog::new(), stop).await;

    flushing.cancel();
    if let Err(error) = flusher.await {
        warn!(%error, "flush task failed");
    }
    let code = match result {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = %error, "product service failed");
            ExitCode::FAILURE
        }
    };
    pipeline.shutdown().await;
    code
}
