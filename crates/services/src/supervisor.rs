//! Service life-cycle harness.
//!
//! Everything the node runs long-term implements [`Service`]: child
//! processes, HTTP listeners, and the background loops that drive the
//! machine. A [`Supervisor`] owns a set of services and gives them a
//! shared life cycle:
//!
//! ```text
//!   start()            ready            shutdown
//!      │                 │                  │
//!      ▼                 ▼                  ▼
//!   spawn s1 ── wait ── spawn s2 ── ... ── cancel ctx ── drain all
//! ```
//!
//! ## Startup
//!
//! Services start strictly in registration order. Each one must signal
//! readiness before the next is spawned, so a service may assume that
//! everything registered before it is already serving. A service that
//! exits, errors, or stalls past the ready timeout aborts the startup
//! and tears down whatever is already running.
//!
//! ## Shutdown
//!
//! Shutdown is level-triggered through a `watch` channel: the supervisor
//! flips the shared flag to `true` and every service winds down on its
//! own. The drain is bounded; services still running after the stop
//! timeout are abandoned and the supervisor reports
//! [`ServiceError::SupervisorTimeout`].
//!
//! A `Supervisor` is itself a `Service`, so trees of supervisors compose.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_all;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// How long a service may take to signal readiness during startup.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the drain may take once shutdown has been requested.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Failure modes of managed services and the supervisor itself.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    /// The child process could not be spawned at all.
    #[error("failed to spawn `{service}`: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// A child process exited on its own while it was supposed to run.
    #[error("`{service}` exited unexpectedly ({status})")]
    Exited { service: String, status: String },

    /// An HTTP listener could not bind or failed while serving.
    #[error("http service `{service}` failed: {source}")]
    Http {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// A service missed the readiness deadline during startup.
    #[error("service `{service}` did not become ready in time")]
    ServiceTimeout { service: String },

    /// The drain deadline expired with services still running.
    #[error("services did not stop within {timeout:?}")]
    SupervisorTimeout { timeout: Duration },

    /// Anything a service wants to surface that has no dedicated variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ════════════════════════════════════════════════════════════════════════════
// SERVICE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// A long-running unit of the node with a supervised life cycle.
#[async_trait]
pub trait Service: Send + 'static {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Runs the service until it is told to stop.
    ///
    /// `ready` must be sent exactly once, as soon as the service can do
    /// useful work; keep the sender alive until then. `ctx` flips to
    /// `true` when the service must wind down, after which `start`
    /// should return promptly. Returning `Ok` means the service stopped
    /// because it was asked to (or had nothing left to do); any exit the
    /// service did not choose is an `Err`.
    async fn start(
        &mut self,
        ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()>;
}

/// Resolves once the shared shutdown flag flips to `true`.
///
/// A closed channel counts as a shutdown request, so services never
/// outlive their supervisor.
pub async fn cancelled(ctx: &mut watch::Receiver<bool>) {
    let _ = ctx.wait_for(|stop| *stop).await;
}

// ════════════════════════════════════════════════════════════════════════════
// SUPERVISOR
// ════════════════════════════════════════════════════════════════════════════

type ServiceHandle = (String, JoinHandle<ServiceResult<()>>);

/// Starts services in order, watches them, and winds them down together.
pub struct Supervisor {
    name: String,
    services: Vec<Box<dyn Service>>,
    ready_timeout: Duration,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Registers a service; startup order is registration order.
    pub fn add(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

#[async_trait]
impl Service for Supervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        mut ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut handles: Vec<ServiceHandle> = Vec::new();
        let mut first_error: Option<ServiceError> = None;
        let mut timed_out: Option<String> = None;

        // Startup: one service at a time, in registration order.
        let mut all_ready = true;
        for mut service in self.services.drain(..) {
            let service_name = service.name().to_string();
            let (ready_tx, ready_rx) = oneshot::channel();
            let service_ctx = cancel_rx.clone();
            let handle =
                tokio::spawn(async move { service.start(service_ctx, ready_tx).await });
            handles.push((service_name.clone(), handle));
            debug!(supervisor = %self.name, service = %service_name, "starting service");

            let started = tokio::select! {
                ready = ready_rx => match ready {
                    Ok(()) => {
                        info!(supervisor = %self.name, service = %service_name, "service ready");
                        true
                    }
                    // Sender dropped without firing: the service is on its
                    // way out and the drain below will collect its result.
                    Err(_) => false,
                },
                exited = wait_any_exit(&mut handles) => {
                    let (name, result) = exited;
                    if let Some(error) = error_of(result, &name) {
                        warn!(supervisor = %self.name, service = %name, %error, "service failed during startup");
                        first_error.get_or_insert(error);
                    }
                    false
                }
                _ = sleep(self.ready_timeout) => {
                    warn!(supervisor = %self.name, service = %service_name, "service missed the ready deadline");
                    timed_out.get_or_insert(service_name.clone());
                    false
                }
                _ = cancelled(&mut ctx) => false,
            };
            if !started {
                all_ready = false;
                break;
            }
        }

        // Steady state: everything is up, so the supervisor itself is ready.
        if all_ready {
            let _ = ready.send(());
            info!(supervisor = %self.name, services = handles.len(), "all services ready");
            if handles.is_empty() {
                cancelled(&mut ctx).await;
            } else {
                tokio::select! {
                    _ = cancelled(&mut ctx) => {
                        debug!(supervisor = %self.name, "shutdown requested");
                    }
                    exited = wait_any_exit(&mut handles) => {
                        let (name, result) = exited;
                        match error_of(result, &name) {
                            Some(error) => {
                                warn!(supervisor = %self.name, service = %name, %error, "service failed");
                                first_error.get_or_insert(error);
                            }
                            None => {
                                info!(supervisor = %self.name, service = %name, "service finished, winding down");
                            }
                        }
                    }
                }
            }
        }

        // Shutdown: flip the shared flag and drain what is still running.
        let _ = cancel_tx.send(true);
        let drained = timeout(self.stop_timeout, async {
            for (name, handle) in handles.drain(..) {
                if let Some(error) = error_of(handle.await, &name) {
                    first_error.get_or_insert(error);
                }
            }
        })
        .await;
        if drained.is_err() {
            return Err(ServiceError::SupervisorTimeout {
                timeout: self.stop_timeout,
            });
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if let Some(service) = timed_out {
            return Err(ServiceError::ServiceTimeout { service });
        }
        Ok(())
    }
}

/// Waits for any running service task to finish and removes it from the
/// set. Must not be called with an empty set.
async fn wait_any_exit(
    handles: &mut Vec<ServiceHandle>,
) -> (String, Result<ServiceResult<()>, tokio::task::JoinError>) {
    let (result, index, _) =
        select_all(handles.iter_mut().map(|(_, handle)| handle)).await;
    let (name, _) = handles.remove(index);
    (name, result)
}

fn error_of(
    result: Result<ServiceResult<()>, tokio::task::JoinError>,
    name: &str,
) -> Option<ServiceError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(join_error) => Some(ServiceError::Other(anyhow::anyhow!(
            "task for service `{name}` failed: {join_error}"
        ))),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
