//! The inspect HTTP API.
//!
//! Read-only queries against the live machine state:
//!
//! - `GET /inspect/{payload}` takes the payload URL-encoded in the path;
//! - `POST /inspect` takes it as the raw request body;
//! - `GET /inspect` queries with an empty payload.
//!
//! Every query runs on a throwaway fork under a low-priority lock, so
//! inspects never block a pending advance and never touch the live
//! state. Machine verdicts are data, not transport failures: accepted,
//! rejected and exception outcomes all come back as `200` with a JSON
//! body carrying the verdict and the hex-encoded reports. Only a broken
//! machine yields a `500`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use oren_common::abi;
use oren_common::Query;
use oren_machine::{MachineBinding, MachineRunner, RollupError};

// ════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ════════════════════════════════════════════════════════════════════════════

/// Machine verdict for one inspect query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InspectStatus {
    Accepted,
    Rejected,
    Exception,
    MachineError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectResponse {
    pub status: InspectStatus,
    /// Reports emitted while the query ran, `0x`-prefixed hex.
    pub reports: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InspectResponse {
    fn verdict(status: InspectStatus, reports: &[Vec<u8>]) -> Self {
        Self {
            status,
            reports: reports
                .iter()
                .map(|report| format!("0x{}", hex::encode(report)))
                .collect(),
            error: None,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ROUTER
// ════════════════════════════════════════════════════════════════════════════

/// Inspect routes over a shared runner.
pub fn inspect_router<B: MachineBinding>(runner: Arc<MachineRunner<B>>) -> Router {
    Router::new()
        .route("/inspect", get(inspect_root::<B>).post(inspect_body::<B>))
        .route("/inspect/*payload", get(inspect_path::<B>))
        .with_state(runner)
}

async fn inspect_root<B: MachineBinding>(
    State(runner): State<Arc<MachineRunner<B>>>,
) -> (StatusCode, Json<InspectResponse>) {
    respond(&runner, Vec::new()).await
}

async fn inspect_path<B: MachineBinding>(
    State(runner): State<Arc<MachineRunner<B>>>,
    Path(payload): Path<String>,
) -> (StatusCode, Json<InspectResponse>) {
    respond(&runner, payload.into_bytes()).await
}

async fn inspect_body<B: MachineBinding>(
    State(runner): State<Arc<MachineRunner<B>>>,
    body: Bytes,
) -> (StatusCode, Json<InspectResponse>) {
    respond(&runner, body.to_vec()).await
}

async fn respond<B: MachineBinding>(
    runner: &MachineRunner<B>,
    payload: Vec<u8>,
) -> (StatusCode, Json<InspectResponse>) {
    let length = payload.len();
    let query = abi::encode_inspect(&Query { payload });
    match runner.inspect(&query).await {
        Ok(reports) => {
            debug!(length, reports = reports.len(), "inspect accepted");
            (
                StatusCode::OK,
                Json(InspectResponse::verdict(InspectStatus::Accepted, &reports)),
            )
        }
        Err(RollupError::LastInputWasRejected { emissions }) => (
            StatusCode::OK,
            Json(InspectResponse::verdict(
                InspectStatus::Rejected,
                &emissions.reports,
            )),
        ),
        Err(RollupError::LastInputYieldedAnException { emissions }) => (
            StatusCode::OK,
            Json(InspectResponse::verdict(
                InspectStatus::Exception,
                &emissions.reports,
            )),
        ),
        Err(error) => {
            warn!(%error, "inspect failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InspectResponse {
                    status: InspectStatus::MachineError,
                    reports: Vec::new(),
                    error: Some(error.to_string()),
                }),
            )
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
