//! Service life-cycle harness for the node.
//!
//! The node is a handful of long-running pieces: a child process hosting
//! the remote machine manager, HTTP listeners, and background loops that
//! drive the machine. This crate gives them one shape, [`Service`], and
//! one conductor, [`Supervisor`], so the whole node starts in a known
//! order and winds down together.
//!
//! ## Modules
//!
//! - [`supervisor`]: the [`Service`] trait, error type, and [`Supervisor`].
//! - [`command`]: child processes as services, with TCP readiness probes.
//! - [`http`]: axum routers as services, with bounded graceful drains.
//! - [`linewriter`]: line-oriented buffering for child stdio.
//! - [`telemetry`]: readiness and liveness probe routes.
//!
//! ## Life cycle
//!
//! ```text
//!                    ┌────────────┐
//!   Supervisor ────▶ │ Service #1 │──ready──┐
//!                    └────────────┘         ▼
//!                    ┌────────────┐   next starts only
//!                    │ Service #2 │◀──after the previous
//!                    └────────────┘   one is ready
//!                          │
//!                     ctx flips true ──▶ everyone drains
//! ```
//!
//! Shutdown flows through a shared `watch::Receiver<bool>`; services poll
//! it with [`supervisor::cancelled`] and return once it flips.

pub mod command;
pub mod http;
pub mod linewriter;
pub mod supervisor;
pub mod telemetry;

pub use command::{CommandService, CommandSpec, READY_PROBE_INTERVAL, TERMINATION_DRAIN};
pub use http::HttpService;
pub use linewriter::{BoundPortScanner, LineSink, LineWriter, TracingSink};
pub use supervisor::{
    cancelled, Service, ServiceError, ServiceResult, Supervisor, DEFAULT_READY_TIMEOUT,
    DEFAULT_STOP_TIMEOUT,
};
pub use telemetry::{telemetry_router, HealthProbes, DEFAULT_TELEMETRY_ADDRESS};
