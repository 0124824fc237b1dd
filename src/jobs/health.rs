//! Health endpoint: `GET /health` reports whether every started worker is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;

/// Running flags of the started workers.
#[derive(Clone, Default)]
pub struct HealthState {
    flags: Arc<Vec<Arc<AtomicBool>>>,
}

impl HealthState {
    pub fn new(flags: Vec<Arc<AtomicBool>>) -> Self {
        Self {
            flags: Arc::new(flags),
        }
    }

    /// True while every flag is set. Job failures do not affect this.
    pub fn healthy(&self) -> bool {
        self.flags.iter().all(|f| f.load(Ordering::SeqCst))
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> StatusCode {
    if state.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
