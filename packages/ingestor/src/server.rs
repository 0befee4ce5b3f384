//! HTTP Scrape Server
//!
//! Serves the metric endpoints and a health check until cancelled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::exporter::{content_type, ExportError, MetricSnapshotExporter, STREAM_ENDPOINT};
use crate::oracle::{VotePenaltyClient, ORACLE_ENDPOINT};
use crate::session::{SessionState, StateHandle};

pub const HEALTH_ENDPOINT: &str = "/healthz";

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9100";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<MetricSnapshotExporter>,
    pub oracle: Option<Arc<VotePenaltyClient>>,
    pub session: StateHandle,
}

#[derive(Debug, Default, Deserialize)]
pub struct OracleParams {
    #[serde(default)]
    pub address: String,
}

fn exposition(result: Result<String, ExportError>) -> Response {
    match result {
        Ok(body) => ([(header::CONTENT_TYPE, content_type())], body).into_response(),
        Err(e) => {
            error!("Could not render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn stream_metrics(State(state): State<AppState>) -> Response {
    exposition(state.exporter.scrape(STREAM_ENDPOINT))
}

pub async fn oracle_metrics(
    State(state): State<AppState>,
    Query(params): Query<OracleParams>,
) -> Response {
    let Some(oracle) = state.oracle.as_ref() else {
        return (StatusCode::NOT_FOUND, "oracle queries are not configured").into_response();
    };
    let started = Instant::now();
    let result = oracle.scrape(&params.address).await;
    state
        .exporter
        .metrics()
        .observe_scrape(ORACLE_ENDPOINT, started.elapsed());
    exposition(result)
}

pub async fn health(State(state): State<AppState>) -> Response {
    let session = state.session.get();
    let status = match session {
        SessionState::Failed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, session.as_str()).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(STREAM_ENDPOINT, get(stream_metrics))
        .route(ORACLE_ENDPOINT, get(oracle_metrics))
        .route(HEALTH_ENDPOINT, get(health))
        .with_state(state)
}

/// Bind and serve until the token is cancelled
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve_on(listener, state, cancel).await
}

pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics server listening on {}", addr);
        info!("  Transfers: http://{}{}", addr, STREAM_ENDPOINT);
        info!("  Oracle:    http://{}{}?address=<validator>", addr, ORACLE_ENDPOINT);
        info!("  Health:    http://{}{}", addr, HEALTH_ENDPOINT);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Metrics server stopped");
    Ok(())
}
