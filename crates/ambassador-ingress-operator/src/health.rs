//! Liveness and readiness probes.
//!
//! `/healthz` answers as long as the process runs. `/readyz` additionally
//! requires startup to have finished and the API server to answer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::store::ObjectStore;

pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for the probe handlers
pub struct HealthState {
    started: AtomicBool,
    store: Arc<dyn ObjectStore>,
}

impl HealthState {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            started: AtomicBool::new(false),
            store,
        }
    }

    pub fn mark_started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("Health check: operator marked as started");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Serve the probes on localhost until the listener fails.
///
/// Startup is marked complete once the socket is bound.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    // Probes come from the kubelet inside the pod network namespace
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.store.check_readiness().await {
        Ok(true) => StatusCode::OK,
        Ok(false) => {
            debug!("Readiness probe: NOT READY (API server not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (API server unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockObjectStore, StoreError};

    fn state_with(store: MockObjectStore) -> Arc<HealthState> {
        Arc::new(HealthState::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_unavailable_before_startup() {
        let mut store = MockObjectStore::new();
        store.expect_check_readiness().never();

        let result = readyz(State(state_with(store))).await;
        assert_eq!(result, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_ok_when_api_server_answers() {
        let mut store = MockObjectStore::new();
        store.expect_check_readiness().returning(|| Ok(true));

        let state = state_with(store);
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_unavailable_when_api_server_unreachable() {
        let mut store = MockObjectStore::new();
        store
            .expect_check_readiness()
            .returning(|| Err(StoreError::Backend("connection refused".to_string())));

        let state = state_with(store);
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_mark_started_is_idempotent() {
        let state = state_with(MockObjectStore::new());
        assert!(!state.is_started());

        state.mark_started();
        state.mark_started();
        assert!(state.is_started());
    }
}
