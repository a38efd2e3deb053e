use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use notification_batch_engine::config::Settings;
use notification_batch_engine::engine::NotificationEngine;
use notification_batch_engine::preferences::StaticPreferenceStore;
use notification_batch_engine::server::{create_app, AppState};
use notification_batch_engine::telemetry;
use notification_batch_engine::transport::NoopTransport;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    let _telemetry_guard = telemetry::init_telemetry(&settings.log, &settings.otel)?;
    tracing::info!("Configuration loaded");

    // Real deployments plug in their push transport and preference
    // store here; the defaults log deliveries and admit everyone.
    let engine = Arc::new(
        NotificationEngine::from_settings(
            &settings,
            Arc::new(NoopTransport),
            Arc::new(StaticPreferenceStore),
        )
        .await?,
    );
    engine.start().await;

    let app = create_app(AppState {
        engine: engine.clone(),
    });

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining engine...");
    engine.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
