//! Axum routers as supervised services.
//!
//! An [`HttpService`] owns a router and an address. Startup is a bind:
//! the service signals ready the moment the listener exists, since axum
//! accepts connections from then on. Shutdown is graceful: the listener
//! closes immediately, in-flight requests get up to the configured
//! drain window to finish, and whatever is still running after that is
//! abandoned without failing the service.
//!
//! Binding to port zero is supported; the kernel-assigned address is
//! published through [`HttpService::bound_address`] so tests and
//! callers can find the server.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::supervisor::{cancelled, Service, ServiceError, ServiceResult, DEFAULT_STOP_TIMEOUT};

/// Serves one router on one socket under the service life cycle.
pub struct HttpService {
    name: String,
    address: SocketAddr,
    router: Router,
    drain_timeout: Duration,
    bound_tx: watch::Sender<Option<SocketAddr>>,
    bound_rx: watch::Receiver<Option<SocketAddr>>,
}

impl HttpService {
    pub fn new(name: impl Into<String>, address: SocketAddr, router: Router) -> Self {
        let (bound_tx, bound_rx) = watch::channel(None);
        Self {
            name: name.into(),
            address,
            router,
            drain_timeout: DEFAULT_STOP_TIMEOUT,
            bound_tx,
            bound_rx,
        }
    }

    /// Caps how long in-flight requests may run past a shutdown request.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Address the listener actually bound; useful with port zero.
    pub fn bound_address(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound_rx.clone()
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        mut ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()> {
        let listener = TcpListener::bind(self.address)
            .await
            .map_err(|source| ServiceError::Http {
                service: self.name.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ServiceError::Http {
            service: self.name.clone(),
            source,
        })?;
        let _ = self.bound_tx.send(Some(local));
        info!(service = %self.name, address = %local, "http service listening");
        let _ = ready.send(());

        let mut drain_ctx = ctx.clone();
        let server = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move {
                cancelled(&mut drain_ctx).await;
            })
            .into_future();

        tokio::select! {
            served = server => served.map_err(|source| ServiceError::Http {
                service: self.name.clone(),
                source,
            }),
            _ = drain_deadline(&mut ctx, self.drain_timeout) => {
                warn!(service = %self.name, "in-flight requests outlived the drain window");
                Ok(())
            }
        }
    }
}

/// Resolves `drain` after a shutdown request, giving the graceful path
/// that long to finish first.
async fn drain_deadline(ctx: &mut watch::Receiver<bool>, drain: Duration) {
    cancelled(ctx).await;
    sleep(drain).await;
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::time::Instant;
    use tokio::task::JoinHandle;

    fn ping_router() -> Router {
        Router::new().route("/ping", get(|| async { "pong" }))
    }

    async fn launch(
        service: HttpService,
    ) -> (watch::Sender<bool>, SocketAddr, JoinHandle<ServiceResult<()>>) {
        let mut bound = service.bound_address();
        let mut service = service;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { service.start(cancel_rx, ready_tx).await });
        ready_rx.await.unwrap();
        let address = bound.wait_for(|a| a.is_some()).await.unwrap().unwrap();
        (cancel_tx, address, handle)
    }

    #[tokio::test]
    async fn serves_requests_once_ready() {
        let address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let service = HttpService::new("ping", address, ping_router());
        let (cancel_tx, address, handle) = launch(service).await;

        let body = reqwest::get(format!("http://{address}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap();

        let mut service = HttpService::new("conflicted", address, ping_router());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, _ready_rx) = oneshot::channel();
        let error = service.start(cancel_rx, ready_tx).await.unwrap_err();
        assert!(matches!(error, ServiceError::Http { service, .. } if service == "conflicted"));
    }

    #[tokio::test]
    async fn shutdown_waits_for_requests_in_flight() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                sleep(Duration::from_millis(150)).await;
                "done"
            }),
        );
        let address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let service = HttpService::new("slow", address, router);
        let (cancel_tx, address, handle) = launch(service).await;

        let request = tokio::spawn(async move {
            reqwest::get(format!("http://{address}/slow"))
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });
        // Let the request reach the handler, then ask for shutdown.
        sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        assert_eq!(request.await.unwrap(), "done");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drain_window_bounds_the_shutdown() {
        let router = Router::new().route(
            "/stuck",
            get(|| async {
                sleep(Duration::from_secs(60)).await;
                "never"
            }),
        );
        let address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let service =
            HttpService::new("stuck", address, router).with_drain_timeout(Duration::from_millis(100));
        let (cancel_tx, address, handle) = launch(service).await;

        let request = tokio::spawn(async move {
            reqwest::get(format!("http://{address}/stuck")).await
        });
        sleep(Duration::from_millis(50)).await;

        let begun = Instant::now();
        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
        request.abort();
    }
}
