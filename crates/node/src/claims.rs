//! Claim submission.
//!
//! The advance loop seals epochs into claims; this module gets them
//! on-chain. [`Claimer`] polls the repository for unsubmitted claims and
//! pushes each through a [`TransactionSender`], recording the resulting
//! transaction hash. Submission failures are left in place and retried
//! on the next tick, so a flaky chain connection never loses a claim.
//!
//! The only sender shipped here is [`MockTransactionSender`]; real chain
//! bindings are out of scope for the node core.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use oren_common::{Claim, Hash32};
use oren_services::{cancelled, Service, ServiceResult};

use crate::repository::Repository;

// ════════════════════════════════════════════════════════════════════════════
// TRANSACTION SENDER
// ════════════════════════════════════════════════════════════════════════════

/// Submits claims to the settlement chain.
#[async_trait]
pub trait TransactionSender: Send + Sync + 'static {
    /// Submits one claim; resolves to the transaction hash.
    async fn submit_claim(&self, app: &str, claim: &Claim) -> anyhow::Result<String>;
}

/// Records submissions instead of reaching a chain.
///
/// The returned hash is a digest over the claim fields, so repeated
/// submissions of the same claim are recognizable in tests.
#[derive(Debug, Default)]
pub struct MockTransactionSender {
    submitted: Mutex<Vec<(String, Claim)>>,
    fail_next: Mutex<bool>,
}

impl MockTransactionSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<(String, Claim)> {
        self.submitted.lock().clone()
    }

    /// Makes the next submission fail once, for retry tests.
    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl TransactionSender for MockTransactionSender {
    async fn submit_claim(&self, app: &str, claim: &Claim) -> anyhow::Result<String> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            anyhow::bail!("chain endpoint unavailable");
        }
        let mut preimage = Vec::new();
        preimage.extend_from_slice(app.as_bytes());
        preimage.extend_from_slice(&claim.epoch.to_be_bytes());
        preimage.extend_from_slice(claim.claim_hash.as_bytes());
        let tx_hash = format!("0x{}", hex::encode(Hash32::digest(&preimage).as_bytes()));
        self.submitted.lock().push((app.to_string(), claim.clone()));
        Ok(tx_hash)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CLAIMER
// ════════════════════════════════════════════════════════════════════════════

/// Drains sealed claims from the repository into the sender.
pub struct Claimer<R: Repository, T: TransactionSender> {
    app: String,
    repository: Arc<R>,
    sender: Arc<T>,
    poll_interval: Duration,
}

impl<R: Repository, T: TransactionSender> Claimer<R, T> {
    pub fn new(
        app: impl Into<String>,
        repository: Arc<R>,
        sender: Arc<T>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            app: app.into(),
            repository,
            sender,
            poll_interval,
        }
    }

    async fn tick(&self) {
        let claims = match self.repository.unsubmitted_claims(&self.app).await {
            Ok(claims) => claims,
            Err(error) => {
                warn!(app = %self.app, %error, "failed to list pending claims");
                return;
            }
        };
        for claim in claims {
            match self.sender.submit_claim(&self.app, &claim).await {
                Ok(tx_hash) => {
                    info!(
                        app = %self.app,
                        epoch = claim.epoch,
                        claim_hash = %claim.claim_hash,
                        tx_hash = %tx_hash,
                        "claim submitted"
                    );
                    if let Err(error) = self
                        .repository
                        .mark_claim_submitted(&self.app, claim.epoch, &tx_hash)
                        .await
                    {
                        warn!(app = %self.app, epoch = claim.epoch, %error, "failed to record the submission");
                    }
                }
                Err(error) => {
                    // Leave it unsubmitted; the next tick retries.
                    warn!(app = %self.app, epoch = claim.epoch, %error, "claim submission failed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl<R: Repository, T: TransactionSender> Service for Claimer<R, T> {
    fn name(&self) -> &str {
        "claimer"
    }

    async fn start(
        &mut self,
        mut ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ready.send(());
        debug!(app = %self.app, "claimer running");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = cancelled(&mut ctx) => return Ok(()),
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
