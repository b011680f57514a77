//! The advance loop.
//!
//! One explicit ticker drains the application's inbox through the
//! machine runner:
//!
//! ```text
//!   tick ──▶ unprocessed_inputs ──▶ encode ──▶ runner.advance
//!                                                   │
//!                    ┌──────────────────────────────┤
//!                    ▼                              ▼
//!            save_advance_result            mark_input_rejected
//!            (+ claim on epoch edge)        (machine said no)
//! ```
//!
//! The loop is the only advance caller in the node, which is what makes
//! the runner's serialization guarantee hold: inputs are processed one
//! at a time, in inbox order, each on its own fork.
//!
//! ## Error dispositions
//!
//! The runner reports everything; only this loop decides what survives:
//!
//! - machine verdicts (`LastInputWasRejected`, `LastInputYieldedAnException`,
//!   `ReachedLimitCycles`, halt and friends) are deterministic, so the
//!   input is marked rejected and the loop moves on;
//! - transport-level binding errors are transient, so the batch stops
//!   and the same input is retried on the next tick;
//! - a result that cannot be persisted after an accepted advance is
//!   fatal: the machine has already moved past the input, so a retry
//!   would execute it twice and fold its outputs hash into the epoch
//!   a second time;
//! - a poisoned or torn-down runner is fatal and stops the service.
//!
//! ## Claims
//!
//! When an input's block lands in a later epoch than the previous
//! input's, the finished epoch is sealed: the Keccak Merkle root over
//! its accumulated `outputs_hash` values becomes the claim, stored for
//! the claimer to submit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use oren_common::abi;
use oren_common::claim::{compute_claim, crossed_epoch, epoch_of};
use oren_common::{Claim, Hash32, Input};
use oren_machine::{MachineBinding, MachineRunner, RollupError};
use oren_services::{cancelled, HealthProbes, Service, ServiceError, ServiceResult};

use crate::repository::Repository;

// ════════════════════════════════════════════════════════════════════════════
// EPOCH TRACKING
// ════════════════════════════════════════════════════════════════════════════

/// Accumulates `outputs_hash` values for the epoch currently being built.
#[derive(Debug, Default)]
struct EpochAccumulator {
    hashes: Vec<Hash32>,
    first_index: u64,
    last_index: u64,
    previous_block: Option<u64>,
}

impl EpochAccumulator {
    /// Folds one accepted input in; returns the sealed claim when the
    /// input crossed into a new epoch.
    fn note(&mut self, input: &Input, outputs_hash: Hash32, epoch_length: u64) -> Option<Claim> {
        let mut sealed = None;
        if let Some(previous_block) = self.previous_block {
            if crossed_epoch(previous_block, input.block_number, epoch_length) {
                sealed = Some(Claim {
                    epoch: epoch_of(previous_block, epoch_length),
                    first_index: self.first_index,
                    last_index: self.last_index,
                    claim_hash: compute_claim(&self.hashes),
                });
                self.hashes.clear();
            }
        }
        if self.hashes.is_empty() {
            self.first_index = input.index;
        }
        self.hashes.push(outputs_hash);
        self.last_index = input.index;
        self.previous_block = Some(input.block_number);
        sealed
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ADVANCER
// ════════════════════════════════════════════════════════════════════════════

/// Outcome of one input, deciding how the batch continues.
enum Step {
    /// Input settled (accepted or rejected); move to the next one.
    Continue,
    /// Transient failure; retry the same input next tick.
    Retry,
}

/// Polls the repository and drives the machine runner.
pub struct Advancer<B: MachineBinding, R: Repository> {
    app: String,
    runner: Arc<MachineRunner<B>>,
    repository: Arc<R>,
    poll_interval: Duration,
    epoch_length: u64,
    probes: HealthProbes,
    epoch: EpochAccumulator,
}

impl<B: MachineBinding, R: Repository> Advancer<B, R> {
    pub fn new(
        app: impl Into<String>,
        runner: Arc<MachineRunner<B>>,
        repository: Arc<R>,
        poll_interval: Duration,
        epoch_length: u64,
        probes: HealthProbes,
    ) -> Self {
        Self {
            app: app.into(),
            runner,
            repository,
            poll_interval,
            epoch_length,
            probes,
            epoch: EpochAccumulator::default(),
        }
    }

    /// Drains the current batch of unprocessed inputs.
    async fn tick(&mut self, ctx: &watch::Receiver<bool>) -> ServiceResult<()> {
        let inputs = match self.repository.unprocessed_inputs(&self.app).await {
            Ok(inputs) => inputs,
            Err(error) => {
                warn!(app = %self.app, %error, "failed to read the inbox, retrying next tick");
                return Ok(());
            }
        };
        for input in inputs {
            if *ctx.borrow() {
                break;
            }
            match self.advance_one(&input).await? {
                Step::Continue => continue,
                Step::Retry => break,
            }
        }
        Ok(())
    }

    /// Runs one input through the machine and persists the outcome.
    async fn advance_one(&mut self, input: &Input) -> ServiceResult<Step> {
        let payload = abi::encode_advance(input);
        match self.runner.advance(&payload).await {
            Ok(result) => {
                info!(
                    app = %self.app,
                    index = input.index,
                    outputs = result.outputs.len(),
                    reports = result.reports.len(),
                    machine_hash = %result.machine_hash,
                    "input accepted"
                );
                if let Err(error) = self
                    .repository
                    .save_advance_result(&self.app, input, &result)
                    .await
                {
                    // The live machine already moved past this input; a
                    // retry would run it twice and double-count its
                    // outputs hash in the epoch.
                    self.probes.set_alive(false);
                    return Err(ServiceError::Other(anyhow::anyhow!(
                        "input {} advanced but its result was not persisted: {error}",
                        input.index
                    )));
                }
                if let Some(claim) = self.epoch.note(input, result.outputs_hash, self.epoch_length)
                {
                    self.seal_epoch(claim).await;
                }
                Ok(Step::Continue)
            }
            Err(error) => self.settle_failure(input, error).await,
        }
    }

    /// Maps a runner error to the input's disposition.
    async fn settle_failure(&mut self, input: &Input, error: RollupError) -> ServiceResult<Step> {
        let verdict = match &error {
            RollupError::LastInputWasRejected { .. } => "machine rejected the input",
            RollupError::LastInputYieldedAnException { .. } => "machine raised an exception",
            RollupError::ReachedLimitCycles { .. } => "cycle limit exceeded",
            RollupError::Halted => "machine halted",
            RollupError::Failed => "machine failed",
            RollupError::YieldedSoftly => "machine yielded softly",
            RollupError::PayloadTooLarge { .. } => "payload too large",
            RollupError::UnexpectedYieldReason { .. } => "machine broke the yield protocol",

            // Remote hiccup: the input itself is fine, try again later.
            RollupError::Binding(binding) => {
                warn!(app = %self.app, index = input.index, error = %binding, "machine call failed, retrying next tick");
                return Ok(Step::Retry);
            }

            // The runner lost its machine; nothing more can be advanced.
            RollupError::NoLiveMachine
            | RollupError::NotAtManualYield
            | RollupError::BindingDestroy(_)
            | RollupError::RemoteShutdown(_)
            | RollupError::TeardownFailed { .. } => {
                self.probes.set_alive(false);
                return Err(ServiceError::Other(anyhow::anyhow!(
                    "advancing input {} failed fatally: {error}",
                    input.index
                )));
            }
        };

        info!(app = %self.app, index = input.index, verdict, "input settled without a state change");
        if let Err(error) = self
            .repository
            .mark_input_rejected(&self.app, input, verdict)
            .await
        {
            warn!(app = %self.app, index = input.index, %error, "failed to persist the rejection");
            return Ok(Step::Retry);
        }
        Ok(Step::Continue)
    }

    async fn seal_epoch(&self, claim: Claim) {
        info!(
            app = %self.app,
            epoch = claim.epoch,
            first_index = claim.first_index,
            last_index = claim.last_index,
            claim_hash = %claim.claim_hash,
            "epoch sealed"
        );
        if let Err(error) = self.repository.save_claim(&self.app, &claim).await {
            // The accumulator has moved on; the epoch's claim is lost until
            // a replay. Persistent backends make this impossible to hit.
            warn!(app = %self.app, epoch = claim.epoch, %error, "failed to store the claim");
        }
    }
}

#[async_trait]
impl<B: MachineBinding, R: Repository> Service for Advancer<B, R> {
    fn name(&self) -> &str {
        "advancer"
    }

    async fn start(
        &mut self,
        mut ctx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> ServiceResult<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ready.send(());
        self.probes.set_ready(true);
        info!(app = %self.app, interval = ?self.poll_interval, "advance loop running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(&ctx).await {
                        self.probes.set_ready(false);
                        return Err(error);
                    }
                }
                _ = cancelled(&mut ctx) => {
                    self.probes.set_ready(false);
                    debug!(app = %self.app, "advance loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        InMemoryRepository, InputDisposition, RepositoryError, RepositoryResult,
    };
    use oren_common::{Address, AdvanceResult};
    use oren_machine::emulated::{EmulatedHost, RequestScript};
    use oren_machine::{CycleBudget, RequestKind, RollupMachine};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    fn input(index: u64, block_number: u64) -> Input {
        Input {
            sender: Address::from_bytes([0x22; 20]),
            block_number,
            block_timestamp: 1_700_000_000,
            index,
            payload: vec![0xau8, index as u8],
        }
    }

    async fn spawn_advancer(
        host: &Arc<EmulatedHost>,
        scripts: Vec<RequestScript>,
        repository: Arc<InMemoryRepository>,
        epoch_length: u64,
    ) -> (watch::Sender<bool>, JoinHandle<ServiceResult<()>>) {
        let machine = host.load(scripts);
        let rollup = RollupMachine::new(machine, CycleBudget::default()).await.unwrap();
        let runner = Arc::new(MachineRunner::new(rollup, 2));
        let mut advancer = Advancer::new(
            "dapp",
            runner,
            repository,
            Duration::from_millis(10),
            epoch_length,
            HealthProbes::new(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { advancer.start(cancel_rx, ready_tx).await });
        ready_rx.await.unwrap();
        (cancel_tx, handle)
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        let begun = Instant::now();
        while !check() {
            assert!(begun.elapsed() < deadline, "condition not met in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // A. Processing
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn drains_the_inbox_in_order() {
        let host = Arc::new(EmulatedHost::new());
        let repository = Arc::new(InMemoryRepository::new());
        repository.enqueue_input("dapp", input(0, 1));
        repository.enqueue_input("dapp", input(1, 2));

        let scripts = vec![
            RequestScript::new().output(b"first").then_accept(),
            RequestScript::new().then_accept(),
        ];
        let (cancel_tx, handle) =
            spawn_advancer(&host, scripts, Arc::clone(&repository), 7200).await;

        let repo = Arc::clone(&repository);
        wait_until(Duration::from_secs(5), move || repo.processed("dapp").len() == 2).await;

        let processed = repository.processed("dapp");
        assert_eq!(processed[0].input.index, 0);
        assert_eq!(processed[1].input.index, 1);
        match &processed[0].disposition {
            InputDisposition::Accepted(result) => {
                assert_eq!(result.outputs, vec![b"first".to_vec()]);
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
        assert!(repository.unprocessed_inputs("dapp").await.unwrap().is_empty());

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejected_input_is_settled_and_skipped() {
        let host = Arc::new(EmulatedHost::new());
        let repository = Arc::new(InMemoryRepository::new());
        repository.enqueue_input("dapp", input(0, 1));
        repository.enqueue_input("dapp", input(1, 2));

        let scripts = vec![
            RequestScript::new().then_reject(),
            RequestScript::new().then_accept(),
        ];
        let (cancel_tx, handle) =
            spawn_advancer(&host, scripts, Arc::clone(&repository), 7200).await;

        let repo = Arc::clone(&repository);
        wait_until(Duration::from_secs(5), move || repo.processed("dapp").len() == 2).await;

        let processed = repository.processed("dapp");
        assert!(matches!(
            &processed[0].disposition,
            InputDisposition::Rejected { reason } if reason.contains("rejected")
        ));
        assert!(matches!(
            processed[1].disposition,
            InputDisposition::Accepted(_)
        ));

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exception_keeps_the_loop_alive() {
        let host = Arc::new(EmulatedHost::new());
        let repository = Arc::new(InMemoryRepository::new());
        repository.enqueue_input("dapp", input(0, 1));

        let scripts = vec![RequestScript::new()
            .output(b"partial")
            .then_exception(b"panic")];
        let (cancel_tx, handle) =
            spawn_advancer(&host, scripts, Arc::clone(&repository), 7200).await;

        let repo = Arc::clone(&repository);
        wait_until(Duration::from_secs(5), move || repo.processed("dapp").len() == 1).await;

        assert!(matches!(
            &repository.processed("dapp")[0].disposition,
            InputDisposition::Rejected { reason } if reason.contains("exception")
        ));

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    // ────────────────────────────────────────────────────────────────────────
    // B. Claims
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn crossing_an_epoch_seals_a_claim() {
        let host = Arc::new(EmulatedHost::new());
        let repository = Arc::new(InMemoryRepository::new());
        // Epoch length 10: blocks 3 and 7 fall in epoch 0, block 12 in epoch 1.
        repository.enqueue_input("dapp", input(0, 3));
        repository.enqueue_input("dapp", input(1, 7));
        repository.enqueue_input("dapp", input(2, 12));

        let scripts = vec![
            RequestScript::new().output(b"a").then_accept(),
            RequestScript::new().output(b"b").then_accept(),
            RequestScript::new().then_accept(),
        ];
        let (cancel_tx, handle) = spawn_advancer(&host, scripts, Arc::clone(&repository), 10).await;

        let repo = Arc::clone(&repository);
        wait_until(Duration::from_secs(5), move || !repo.claims("dapp").is_empty()).await;

        let claims = repository.claims("dapp");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim.epoch, 0);
        assert_eq!(claims[0].claim.first_index, 0);
        assert_eq!(claims[0].claim.last_index, 1);

        // The claim is the Merkle root over the epoch's outputs hashes.
        let processed = repository.processed("dapp");
        let hashes: Vec<Hash32> = processed[..2]
            .iter()
            .map(|p| match &p.disposition {
                InputDisposition::Accepted(result) => result.outputs_hash,
                other => panic!("unexpected disposition: {other:?}"),
            })
            .collect();
        assert_eq!(claims[0].claim.claim_hash, compute_claim(&hashes));

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    // ────────────────────────────────────────────────────────────────────────
    // C. Fatal errors
    // ────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn poisoned_runner_stops_the_service() {
        let host = Arc::new(EmulatedHost::new());
        let repository = Arc::new(InMemoryRepository::new());

        let machine = host.load(Vec::new());
        let rollup = RollupMachine::new(machine, CycleBudget::default()).await.unwrap();
        let runner = Arc::new(MachineRunner::new(rollup, 2));
        runner.shutdown().await.unwrap();

        repository.enqueue_input("dapp", input(0, 1));
        let mut advancer = Advancer::new(
            "dapp",
            runner,
            Arc::clone(&repository),
            Duration::from_millis(10),
            7200,
            HealthProbes::new(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, _ready_rx) = oneshot::channel();
        let error = advancer.start(cancel_rx, ready_tx).await.unwrap_err();
        assert!(error.to_string().contains("fatally"));
    }

    /// Delegates to the in-memory store but fails the next result save.
    struct FailNextSave {
        inner: Arc<InMemoryRepository>,
        fail: AtomicBool,
    }

    impl FailNextSave {
        fn new(inner: Arc<InMemoryRepository>) -> Self {
            Self {
                inner,
                fail: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Repository for FailNextSave {
        async fn unprocessed_inputs(&self, app: &str) -> RepositoryResult<Vec<Input>> {
            self.inner.unprocessed_inputs(app).await
        }

        async fn save_advance_result(
            &self,
            app: &str,
            input: &Input,
            result: &AdvanceResult,
        ) -> RepositoryResult<()> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(RepositoryError::UnknownApplication(app.to_string()));
            }
            self.inner.save_advance_result(app, input, result).await
        }

        async fn mark_input_rejected(
            &self,
            app: &str,
            input: &Input,
            reason: &str,
        ) -> RepositoryResult<()> {
            self.inner.mark_input_rejected(app, input, reason).await
        }

        async fn save_claim(&self, app: &str, claim: &Claim) -> RepositoryResult<()> {
            self.inner.save_claim(app, claim).await
        }

        async fn unsubmitted_claims(&self, app: &str) -> RepositoryResult<Vec<Claim>> {
            self.inner.unsubmitted_claims(app).await
        }

        async fn mark_claim_submitted(
            &self,
            app: &str,
            epoch: u64,
            tx_hash: &str,
        ) -> RepositoryResult<()> {
            self.inner.mark_claim_submitted(app, epoch, tx_hash).await
        }

        async fn latest_processed_index(&self, app: &str) -> RepositoryResult<Option<u64>> {
            self.inner.latest_processed_index(app).await
        }
    }

    #[tokio::test]
    async fn unpersisted_result_stops_the_service_without_a_rerun() {
        let host = Arc::new(EmulatedHost::new());
        let store = Arc::new(InMemoryRepository::new());
        // Epoch length 10: block 12 would seal epoch 0 had input 0 counted.
        store.enqueue_input("dapp", input(0, 3));
        store.enqueue_input("dapp", input(1, 12));
        let repository = Arc::new(FailNextSave::new(Arc::clone(&store)));

        let scripts = vec![RequestScript::new().output(b"once").then_accept()];
        let machine = host.load(scripts);
        let rollup = RollupMachine::new(machine, CycleBudget::default()).await.unwrap();
        let runner = Arc::new(MachineRunner::new(rollup, 2));
        let probes = HealthProbes::new();
        let mut advancer = Advancer::new(
            "dapp",
            runner,
            repository,
            Duration::from_millis(10),
            10,
            probes.clone(),
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, _ready_rx) = oneshot::channel();
        let error = advancer.start(cancel_rx, ready_tx).await.unwrap_err();
        assert!(error.to_string().contains("not persisted"));
        assert!(!probes.is_alive());

        // The input hit the machine exactly once; nothing was folded into
        // an epoch, so no claim can commit to a duplicated leaf.
        let advances = host
            .request_log()
            .iter()
            .filter(|request| request.kind == RequestKind::Advance as u32)
            .count();
        assert_eq!(advances, 1);
        assert!(store.processed("dapp").is_empty());
        assert!(store.claims("dapp").is_empty());
    }
}
