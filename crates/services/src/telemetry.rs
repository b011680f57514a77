//! Readiness and liveness probes.
//!
//! The node exposes one telemetry listener with per-service probe routes
//! in the conventional shape, `/{service}/readyz` and `/{service}/livez`.
//! A probe answers `200` when its flag is up and `500` otherwise, which
//! is what container orchestrators expect to poll.
//!
//! [`HealthProbes`] is a pair of shared flags; hand a clone to the code
//! that knows the state and a clone to [`telemetry_router`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

/// Default listen address for the telemetry server.
pub const DEFAULT_TELEMETRY_ADDRESS: &str = "0.0.0.0:8081";

/// Shared readiness and liveness flags for one service.
///
/// Fresh probes are alive but not ready; flip readiness once the service
/// can do useful work.
#[derive(Clone, Debug)]
pub struct HealthProbes {
    ready: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl HealthProbes {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Default for HealthProbes {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe routes for one named service.
pub fn telemetry_router(service: &str, probes: HealthProbes) -> Router {
    Router::new()
        .route(&format!("/{service}/readyz"), get(readyz))
        .route(&format!("/{service}/livez"), get(livez))
        .with_state(probes)
}

async fn readyz(State(probes): State<HealthProbes>) -> (StatusCode, &'static str) {
    if probes.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "not ready")
    }
}

async fn livez(State(probes): State<HealthProbes>) -> (StatusCode, &'static str) {
    if probes.is_alive() {
        (StatusCode::OK, "alive")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "not alive")
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
