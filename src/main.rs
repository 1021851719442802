use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stroke_seg_api::app_state::AppState;
use stroke_seg_api::config::AppConfig;
use stroke_seg_api::routes;
use stroke_seg_api::services::dataset::{self, HubClient};
use stroke_seg_api::services::invoker::build_invoker;
use stroke_seg_api::services::job_store::run_ttl_sweeper;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing stroke-seg-api server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "segmentation_processing_seconds",
        "Time to run one segmentation job end to end"
    );
    metrics::describe_histogram!(
        "segmentation_inference_seconds",
        "Time spent inside the external inference process"
    );
    metrics::describe_counter!(
        "segmentation_jobs_total",
        "Total segmentation jobs admitted"
    );
    metrics::describe_counter!(
        "segmentation_jobs_completed",
        "Total segmentation jobs completed"
    );
    metrics::describe_counter!(
        "segmentation_jobs_failed",
        "Total segmentation jobs that failed"
    );
    metrics::describe_gauge!(
        "segmentation_active_jobs",
        "Jobs currently pending or running"
    );

    // Ensure working directories exist
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .expect("Failed to create dataset directory");
    tokio::fs::create_dir_all(&config.results_dir)
        .await
        .expect("Failed to create results directory");

    // Select the inference strategy
    let invoker = build_invoker(&config).expect("Failed to build inference invoker");
    tracing::info!(
        invoker = invoker.name(),
        timeout_secs = config.inference_timeout_secs,
        "Inference invoker ready"
    );

    let state = AppState::new(config, invoker);

    // Optionally pull missing dataset cases from the Hugging Face Hub
    if let Some(dataset_id) = state.config.hub_dataset_id.clone() {
        tracing::info!(dataset = %dataset_id, "Syncing dataset from the Hugging Face Hub");
        let sync = async {
            let hub = HubClient::new(
                dataset_id,
                state.config.hub_revision.clone(),
                state.config.hub_token.clone(),
            )?;
            dataset::sync_from_hub(&state.catalog, &hub).await
        };
        match sync.await {
            Ok(count) => tracing::info!(files = count, "Hub sync finished"),
            Err(err) => tracing::warn!(error = %err, "Hub sync failed, serving local cases only"),
        }
    }

    // Background TTL sweeper for expired jobs and their result files
    let sweeper_cancel = CancellationToken::new();
    let sweeper_handle = tokio::spawn(run_ttl_sweeper(
        state.jobs.clone(),
        state.config.job_ttl(),
        state.config.sweep_interval(),
        state.config.results_dir.clone(),
        sweeper_cancel.clone(),
    ));

    let bind_addr = state.config.bind_addr.clone();
    let app = routes::router(state, prometheus_handle);

    tracing::info!("Starting stroke-seg-api on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Stop the sweeper before exiting
    sweeper_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper_handle).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server shuts
/// down cleanly whether stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
