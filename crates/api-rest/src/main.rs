//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the REST API server on its own.
//!
//! ## Intended use
//! Useful for development and debugging when you only want the HTTP surface
//! (with OpenAPI/Swagger UI). The workspace's main `visia-run` binary runs
//! the same router together with the periodic maintenance sweep.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use visia_api_rest::{router, AppState};
use visia_core::{
    config::delivery_sla_rule, CoreConfig, EventSink, LoggingConsentChannel, TracingEventSink,
    WorkflowCoordinator,
};

/// Falls back to the standard pathway policy when no config file is named.
fn load_config() -> anyhow::Result<CoreConfig> {
    match std::env::var("VISIA_PATHWAY_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("cannot read pathway config {path}: {e}"))?;
            Ok(CoreConfig::from_yaml(&raw)?)
        }
        Err(_) => Ok(CoreConfig::new(
            chrono::Duration::days(14),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
            vec![delivery_sla_rule(14)],
            vec![],
        )?),
    }
}

/// Main entry point for the Visia REST API server
///
/// Starts the REST API server on the configured address (default: 0.0.0.0:3000).
///
/// # Environment Variables
/// - `VISIA_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `VISIA_PATHWAY_CONFIG`: Pathway policy file (YAML); built-in defaults
///   apply when unset
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the pathway configuration is invalid,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("visia_api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("VISIA_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    tracing::info!("-- Starting Visia REST API on {}", addr);

    let config = load_config()?;
    let coordinator = Arc::new(WorkflowCoordinator::new(
        &config,
        Arc::new(LoggingConsentChannel),
        Arc::new(TracingEventSink) as Arc<dyn EventSink>,
    ));
    let app = router(AppState { coordinator });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
