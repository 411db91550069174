use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod broker;
mod config;
mod db;
mod error;
mod events;
mod idempotency;
mod intake;
mod ocr;
mod resilience;
mod service;
mod storage;
mod summarizer;

use crate::config::StaticConfig;
use crate::db::Database;
use crate::service::PipelineService;
use crate::summarizer::HttpSummarizer;

// Re-export config crate types to avoid namespace collision
use ::config::{Config as ConfigBuilder, Environment, File};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting docflow pipeline service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config: StaticConfig = ConfigBuilder::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("DOCFLOW")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.storage.data_dir)?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port);
    }

    // Initialize database
    let db_path = config.storage.data_dir.join("docflow.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    // Summarizer client
    let summarizer = Arc::new(HttpSummarizer::new(config.summarizer.clone())?);
    if summarizer.health_check().await {
        info!(url = %config.summarizer.base_url, "Summarizer endpoint is available");
    } else {
        warn!(url = %config.summarizer.base_url, "Summarizer endpoint is not available");
    }

    // OCR engine (Tesseract with the `ocr` feature, stub otherwise)
    let recognizer = ocr::default_recognizer(&config.extraction.ocr_language);

    let service = PipelineService::new(config.clone(), db, recognizer, summarizer)?;

    let shutdown = CancellationToken::new();

    // Stage consumer pools
    PipelineService::start_workers(&service, &shutdown);

    // Background sweep bounding the idempotency store
    idempotency::start_sweeper(
        service.idempotency.clone(),
        config.idempotency.sweep_interval(),
        shutdown.clone(),
    );

    // Intake watcher, if configured
    if let Some(intake_dir) = &config.storage.intake_dir {
        intake::start_intake_worker(service.clone(), intake_dir.clone(), shutdown.clone());
    }

    info!("Pipeline running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    // Give consumers a moment to finish in-flight work.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    info!("Stopped");

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docflow_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}

fn init_metrics(port: u16) {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
    {
        Ok(()) => info!(port, "Prometheus exporter listening"),
        Err(e) => warn!(error = %e, "Failed to install Prometheus exporter, metrics disabled"),
    }
}
