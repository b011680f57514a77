//! Serialized access to the live machine, with forked execution.
//!
//! The runner owns the node's one live [`RollupMachine`] and never runs a
//! request on it directly. Both request paths fork first:
//!
//! * `advance` forks, processes the input on the fork, then swaps the fork
//!   in as the new live machine and destroys the old one. A failed input
//!   costs one discarded fork; the live machine is untouched.
//! * `inspect` forks, processes the query on the fork, and destroys the
//!   fork unconditionally. The live machine never observes queries.
//!
//! ## Lock discipline
//!
//! The live handle sits behind a [`PriorityMutex`]. Advances take the lock
//! as high priority and only for the two short sections that touch the
//! slot (fork, swap); the VM run itself happens unlocked. Inspects take
//! the lock as low priority for their fork, so a burst of queries cannot
//! starve the advance path. A semaphore bounds how many inspect forks
//! exist at once, which bounds remote process count and memory.
//!
//! ## Poisoning
//!
//! If destroying the old live machine during a swap fails, the slot is in
//! an unknown state and the runner poisons itself: the slot becomes empty
//! and every later request fails with [`RollupError::NoLiveMachine`].

use crate::bindings::{MachineBinding, RequestKind};
use crate::pmutex::PriorityMutex;
use crate::rollup::{RollupError, RollupMachine, RollupResult};
use oren_common::merkle::outputs_merkle;
use oren_common::types::AdvanceResult;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Default bound on concurrent inspect forks.
pub const DEFAULT_INSPECT_CONCURRENCY: usize = 8;

/// Destroys a fork that will not be swapped in. Failures are logged and
/// swallowed; the caller already has a more interesting error to return.
async fn discard_fork<B: MachineBinding>(fork: RollupMachine<B>) {
    let endpoint = fork.endpoint().to_string();
    if let Err(teardown) = fork.destroy().await {
        warn!(endpoint, %teardown, "failed to destroy discarded fork");
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MACHINE RUNNER
// ════════════════════════════════════════════════════════════════════════════

/// Owner of the live machine handle.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct MachineRunner<B: MachineBinding> {
    live: PriorityMutex<Option<RollupMachine<B>>>,
    inspect_permits: Semaphore,
}

impl<B: MachineBinding> MachineRunner<B> {
    /// Wraps a primed machine. `inspect_concurrency` bounds simultaneous
    /// inspect forks.
    pub fn new(machine: RollupMachine<B>, inspect_concurrency: usize) -> Self {
        Self {
            live: PriorityMutex::new(Some(machine)),
            inspect_permits: Semaphore::new(inspect_concurrency),
        }
    }

    /// Endpoint of the current live machine.
    pub async fn endpoint(&self) -> RollupResult<String> {
        let guard = self.live.acquire_low().await;
        let live = guard.as_ref().ok_or(RollupError::NoLiveMachine)?;
        Ok(live.endpoint().to_string())
    }

    /// Advances the machine state with one input.
    ///
    /// On success the runner's live machine is the post-input fork and the
    /// pre-input machine is gone. On failure the pre-input machine stays
    /// live and the fork is discarded, except when destroying the old
    /// machine during the swap fails, which poisons the runner.
    pub async fn advance(&self, data: &[u8]) -> RollupResult<AdvanceResult> {
        // Fork under the high-priority lock, run unlocked.
        let mut fork = {
            let guard = self.live.acquire_high().await;
            let live = guard.as_ref().ok_or(RollupError::NoLiveMachine)?;
            live.fork().await?
        };

        let emissions = match fork.process(data, RequestKind::Advance).await {
            Ok(emissions) => emissions,
            Err(error) => {
                discard_fork(fork).await;
                return Err(error);
            }
        };
        let machine_hash = match fork.root_hash().await {
            Ok(hash) => hash,
            Err(error) => {
                discard_fork(fork).await;
                return Err(error);
            }
        };

        // Swap under the high-priority lock.
        let mut guard = self.live.acquire_high().await;
        let Some(old) = guard.take() else {
            drop(guard);
            discard_fork(fork).await;
            return Err(RollupError::NoLiveMachine);
        };
        if let Err(error) = old.destroy().await {
            // The slot stays empty; this runner is done.
            drop(guard);
            warn!(%error, "destroying the pre-input machine failed, poisoning runner");
            discard_fork(fork).await;
            return Err(error);
        }
        debug!(endpoint = fork.endpoint(), outputs = emissions.outputs.len(), reports = emissions.reports.len(), "advanced machine");
        *guard = Some(fork);
        drop(guard);

        let outputs_hash = outputs_merkle(&emissions.outputs);
        Ok(AdvanceResult {
            outputs: emissions.outputs,
            reports: emissions.reports,
            outputs_hash,
            machine_hash,
        })
    }

    /// Answers a read-only query against the current state.
    ///
    /// The query runs on a throwaway fork and returns the reports it
    /// emitted. Rejections and exceptions surface as their usual errors,
    /// with the fork's emissions attached.
    pub async fn inspect(&self, query: &[u8]) -> RollupResult<Vec<Vec<u8>>> {
        let _permit = self
            .inspect_permits
            .acquire()
            .await
            .map_err(|_| RollupError::NoLiveMachine)?;

        let mut fork = {
            let guard = self.live.acquire_low().await;
            let live = guard.as_ref().ok_or(RollupError::NoLiveMachine)?;
            live.fork().await?
        };

        let processed = fork.process(query, RequestKind::Inspect).await;
        let destroyed = fork.destroy().await;
        match (processed, destroyed) {
            (Ok(emissions), Ok(())) => Ok(emissions.reports),
            (Ok(_), Err(teardown)) => Err(teardown),
            (Err(error), destroyed) => {
                if let Err(teardown) = destroyed {
                    warn!(%teardown, "failed to destroy inspect fork after failed query");
                }
                Err(error)
            }
        }
    }

    /// Destroys the live machine and refuses all further requests.
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn shutdown(&self) -> RollupResult<()> {
        self.inspect_permits.close();
        let mut guard = self.live.acquire_high().await;
        match guard.take() {
            Some(machine) => machine.destroy().await,
            None => Ok(()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
