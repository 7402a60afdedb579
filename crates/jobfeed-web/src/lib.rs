//! Liveness surface and the long-running `serve` mode.

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use jobfeed_storage::PgJobStore;
use jobfeed_sync::{IngestionOrchestrator, SyncConfig};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobfeed-web";

pub const LIVENESS_BODY: &str = "Feed Ingestion Service Running...";

pub fn app() -> Router {
    Router::new().route("/", get(index_handler))
}

async fn index_handler() -> &'static str {
    LIVENESS_BODY
}

/// Serves the liveness route and, when enabled, runs ingestion cycles on the
/// configured cron schedule.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();

    // Kept alive for the lifetime of the server.
    let _scheduler = if config.scheduler_enabled {
        let store = PgJobStore::connect(&config.database_url, config.db_max_connections).await?;
        let orchestrator = Arc::new(IngestionOrchestrator::from_config(&config, Arc::new(store))?);
        match orchestrator.maybe_build_scheduler(&config).await? {
            Some(sched) => {
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            }
            None => None,
        }
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, scheduler = config.scheduler_enabled, "serving");
    axum::serve(listener, app()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let resp = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], LIVENESS_BODY.as_bytes());
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let resp = app()
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
