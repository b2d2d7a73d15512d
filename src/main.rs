//! Main entry point for the Visia workflow service.
//!
//! Runs the REST API together with the periodic maintenance sweep that
//! expires unanswered consent requests, lapses stale reservation holds, and
//! flags breached SLA deadlines.

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use visia_api_rest::{router, AppState};
use visia_core::{
    config::delivery_sla_rule, CoreConfig, EventSink, LoggingConsentChannel, TracingEventSink,
    WorkflowCoordinator,
};

/// Loads the pathway policy from `VISIA_PATHWAY_CONFIG`, falling back to the
/// programme's standard policy when unset.
fn load_config() -> anyhow::Result<CoreConfig> {
    match std::env::var("VISIA_PATHWAY_CONFIG") {
        Ok(path) => {
            tracing::info!("loading pathway config from {path}");
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

/// Starts the HTTP server and the sweep task concurrently.
///
/// # Environment Variables
/// - `VISIA_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `VISIA_PATHWAY_CONFIG`: Pathway policy file (YAML)
/// - `VISIA_SWEEP_INTERVAL_SECS`: Maintenance sweep period (default: 60)
///
/// # Errors
/// Returns an error if the tracing setup, the pathway configuration, or the
/// server bind fails, or if the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("visia_core=info".parse()?)
                .add_directive("visia_api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("VISIA_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let sweep_secs: u64 = std::env::var("VISIA_SWEEP_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".into())
        .parse()?;

    tracing::info!("++ Starting Visia REST on {}", rest_addr);

    let config = load_config()?;
    let coordinator = Arc::new(WorkflowCoordinator::new(
        &config,
        Arc::new(LoggingConsentChannel),
        Arc::new(TracingEventSink) as Arc<dyn EventSink>,
    ));

    let sweeper = coordinator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_secs));
        loop {
            ticker.tick().await;
            let report = sweeper.run_sweep(chrono::Utc::now());
            if report.expired_consents > 0
                || report.lapsed_reservations > 0
                || !report.breached_deadlines.is_empty()
            {
                tracing::info!(
                    expired_consents = report.expired_consents,
                    lapsed_reservations = report.lapsed_reservations,
                    breached_deadlines = report.breached_deadlines.len(),
                    "maintenance sweep"
                );
            }
        }
    });

    let app = router(AppState { coordinator });
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
