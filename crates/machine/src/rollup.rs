//! Rollup driver for a single machine handle.
//!
//! [`RollupMachine`] wraps a [`MachineBinding`] and speaks the rollup HTIF
//! dialect: requests go in through the rx buffer and the `fromhost`
//! register, emissions come back out through the tx buffer and `tohost`,
//! and the machine parks itself on a manual yield between requests.
//!
//! ## Request life cycle
//!
//! ```text
//!  primed ──write rx──▶ running ──auto yield──▶ read emission ──┐
//!    ▲                     ▲                                    │
//!    │                     └────────────────────────────────────┘
//!    └──────── manual yield (accept / reject / exception) ◀─────┘
//! ```
//!
//! A handle is *primed* when the machine sits at a manual yield whose
//! reason is `RxAccepted`. Every request starts from that state and, on
//! success, ends back in it, so a handle can serve requests indefinitely.
//! Rejections and exceptions are surfaced as errors carrying whatever the
//! machine emitted before bailing out; the handle that produced them is
//! left at the failed yield and is only useful for discarding.
//!
//! ## Cycle budgets
//!
//! The driver never hands the machine an unbounded `run`. It steps in
//! `increment`-sized slices and gives up once a request has consumed `max`
//! cycles, so a wedged guest costs a bounded amount of manager CPU.

use crate::bindings::{
    BreakReason, BufferConfig, MachineBinding, MachineError, RequestKind, YieldReason,
};
use crate::htif;
use oren_common::types::Hash32;
use thiserror::Error;
use tracing::warn;

// ════════════════════════════════════════════════════════════════════════════
// CYCLE BUDGET
// ════════════════════════════════════════════════════════════════════════════

/// Default polling granularity for `run`, in cycles.
pub const DEFAULT_CYCLE_INCREMENT: u64 = 10_000_000;

/// Default per-request cycle ceiling.
pub const DEFAULT_MAX_CYCLES_PER_REQUEST: u64 = 1_000_000_000;

/// Cycle limits applied to every request.
///
/// `increment` trades yield-detection latency against manager round trips;
/// `max` caps how long a single request may run. Forked handles inherit
/// the parent's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBudget {
    /// Cycles per `run` slice.
    pub increment: u64,
    /// Total cycles a request may consume before `ReachedLimitCycles`.
    pub max: u64,
}

impl Default for CycleBudget {
    fn default() -> Self {
        Self {
            increment: DEFAULT_CYCLE_INCREMENT,
            max: DEFAULT_MAX_CYCLES_PER_REQUEST,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// EMISSIONS
// ════════════════════════════════════════════════════════════════════════════

/// Ordered emissions collected while processing one request.
///
/// The machine yields one interleaved sequence; splitting it keeps each
/// stream in yield order but drops the interleaving between outputs and
/// reports. Downstream consumers (the outputs hash, the advance result,
/// inspect responses) only ever read the streams separately, so the
/// merged order is not kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Emissions {
    /// ABI-encoded vouchers and notices.
    pub outputs: Vec<Vec<u8>>,
    /// Free-form diagnostic blobs.
    pub reports: Vec<Vec<u8>>,
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Errors from driving a machine through a request.
#[derive(Error, Debug)]
pub enum RollupError {
    /// The machine is not parked at a manual yield, so no request can be
    /// injected.
    #[error("machine is not parked at a manual yield")]
    NotAtManualYield,

    /// The machine finished the request by rejecting it. Emissions
    /// collected before the rejection are attached for logging.
    #[error("the machine rejected the last request")]
    LastInputWasRejected { emissions: Emissions },

    /// The machine finished the request by raising an exception.
    #[error("the machine raised an exception on the last request")]
    LastInputYieldedAnException { emissions: Emissions },

    /// The request consumed its whole cycle budget without yielding.
    #[error("request exceeded the cycle budget of {limit} cycles")]
    ReachedLimitCycles { limit: u64 },

    /// Soft yields have no meaning in the rollup dialect.
    #[error("machine yielded softly while processing a request")]
    YieldedSoftly,

    /// The guest shut down instead of yielding.
    #[error("machine halted while processing a request")]
    Halted,

    /// The machine faulted.
    #[error("machine failed while processing a request")]
    Failed,

    /// Payload length does not fit the 32-bit HTIF length field.
    #[error("request payload of {length} bytes exceeds the 32-bit length field")]
    PayloadTooLarge { length: usize },

    /// A yield reason that is valid on the wire but nonsensical where it
    /// appeared.
    #[error("unexpected yield reason {reason:?} during {context}")]
    UnexpectedYieldReason {
        context: &'static str,
        reason: YieldReason,
    },

    /// Teardown could not destroy the loaded machine.
    #[error("failed to destroy the loaded machine")]
    BindingDestroy(#[source] MachineError),

    /// Teardown could not terminate the remote process.
    #[error("failed to shut down the remote machine process")]
    RemoteShutdown(#[source] MachineError),

    /// Both halves of teardown failed.
    #[error("machine teardown failed twice: destroy: {destroy}; shutdown: {shutdown}")]
    TeardownFailed {
        destroy: MachineError,
        shutdown: MachineError,
    },

    /// The runner's machine slot is empty after a fatal swap failure or a
    /// shutdown.
    #[error("no live machine behind the runner")]
    NoLiveMachine,

    /// Any binding-level failure.
    #[error(transparent)]
    Binding(#[from] MachineError),
}

/// Result type alias for rollup driver operations.
pub type RollupResult<T> = Result<T, RollupError>;

/// How a `run` sequence came to rest.
enum YieldKind {
    Manual,
    Automatic,
}

// ════════════════════════════════════════════════════════════════════════════
// ROLLUP MACHINE
// ════════════════════════════════════════════════════════════════════════════

/// A machine handle that knows the rollup request protocol.
///
/// Construction verifies the priming invariant, so holding a
/// `RollupMachine` means holding a machine that is ready for its next
/// request (until a request fails, at which point the handle should be
/// discarded with [`RollupMachine::destroy`]).
#[derive(Debug)]
pub struct RollupMachine<B: MachineBinding> {
    binding: B,
    budget: CycleBudget,
}

impl<B: MachineBinding> RollupMachine<B> {
    /// Wraps a binding after verifying the machine behind it is primed.
    ///
    /// On a failed check the remote machine is torn down best-effort
    /// before the error is returned, so a bad snapshot does not leak a
    /// manager process.
    pub async fn new(binding: B, budget: CycleBudget) -> RollupResult<Self> {
        let machine = Self { binding, budget };
        if let Err(error) = machine.check_primed().await {
            if let Err(teardown) = machine.destroy().await {
                warn!(%teardown, "teardown after failed priming check also failed");
            }
            return Err(error);
        }
        Ok(machine)
    }

    /// Address of the remote process backing this handle.
    pub fn endpoint(&self) -> &str {
        self.binding.endpoint()
    }

    /// The budget applied to every request on this handle.
    pub fn budget(&self) -> CycleBudget {
        self.budget
    }

    fn buffers(&self) -> BufferConfig {
        self.binding.buffer_config()
    }

    /// Merkle root hash of the full machine state.
    pub async fn root_hash(&self) -> RollupResult<Hash32> {
        Ok(self.binding.read_root_hash().await?)
    }

    /// Forks the remote machine and returns an independent handle to the
    /// child, inheriting this handle's budget.
    ///
    /// If attaching to the child fails the orphan is reaped best-effort;
    /// a reap failure is logged and never retried, which makes this the
    /// one spot that can leak a remote process.
    pub async fn fork(&self) -> RollupResult<Self> {
        let child_endpoint = self.binding.fork().await?;
        match self.binding.connect(&child_endpoint).await {
            Ok(child) => Ok(Self {
                binding: child,
                budget: self.budget,
            }),
            Err(error) => {
                if let Err(reap) = self.binding.shutdown_endpoint(&child_endpoint).await {
                    warn!(endpoint = %child_endpoint, %reap, "failed to reap orphaned fork");
                }
                Err(error.into())
            }
        }
    }

    /// Destroys the loaded machine, then terminates its process.
    ///
    /// Both calls are always attempted; their failures are reported as
    /// [`RollupError::BindingDestroy`], [`RollupError::RemoteShutdown`],
    /// or [`RollupError::TeardownFailed`] when both go wrong.
    pub async fn destroy(mut self) -> RollupResult<()> {
        let destroyed = self.binding.destroy().await;
        let shut_down = self.binding.shutdown().await;
        match (destroyed, shut_down) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(destroy), Ok(())) => Err(RollupError::BindingDestroy(destroy)),
            (Ok(()), Err(shutdown)) => Err(RollupError::RemoteShutdown(shutdown)),
            (Err(destroy), Err(shutdown)) => {
                Err(RollupError::TeardownFailed { destroy, shutdown })
            }
        }
    }

    /// Runs one request through the machine and collects its emissions.
    ///
    /// On success the machine is primed again. On
    /// [`RollupError::LastInputWasRejected`] and
    /// [`RollupError::LastInputYieldedAnException`] the machine is parked
    /// at the failed yield; callers fork before processing precisely so
    /// they can throw such a handle away.
    pub async fn process(&mut self, data: &[u8], kind: RequestKind) -> RollupResult<Emissions> {
        if data.len() > u32::MAX as usize {
            return Err(RollupError::PayloadTooLarge { length: data.len() });
        }
        let buffers = self.buffers();
        self.binding.write_memory(buffers.rx_buffer_start, data).await?;
        self.binding
            .write_htif_fromhost_data(htif::pack_fromhost(kind, data.len() as u32))
            .await?;
        self.binding.reset_iflags_y().await?;

        let starting_cycle = self.binding.read_mcycle().await?;
        let mut emissions = Emissions::default();
        loop {
            match self.run_until_yield(starting_cycle).await? {
                YieldKind::Manual => break,
                YieldKind::Automatic => match self.read_yield_reason().await? {
                    // Checkpoint hint; nothing to read, budget unchanged.
                    YieldReason::Progress => continue,
                    YieldReason::TxOutput => emissions.outputs.push(self.read_emission().await?),
                    YieldReason::TxReport => emissions.reports.push(self.read_emission().await?),
                    other => {
                        return Err(RollupError::UnexpectedYieldReason {
                            context: "automatic yield",
                            reason: other,
                        })
                    }
                },
            }
        }

        match self.read_yield_reason().await? {
            YieldReason::RxAccepted => Ok(emissions),
            YieldReason::RxRejected => Err(RollupError::LastInputWasRejected { emissions }),
            YieldReason::TxException => {
                Err(RollupError::LastInputYieldedAnException { emissions })
            }
            other => Err(RollupError::UnexpectedYieldReason {
                context: "manual yield",
                reason: other,
            }),
        }
    }

    /// Steps the machine in `increment` slices until it yields.
    ///
    /// The budget is measured against `starting_cycle`, which is fixed for
    /// the whole request; emissions and progress checkpoints do not renew
    /// it.
    async fn run_until_yield(&mut self, starting_cycle: u64) -> RollupResult<YieldKind> {
        let mut current_cycle = self.binding.read_mcycle().await?;
        loop {
            let target = current_cycle.saturating_add(self.budget.increment);
            match self.binding.run(target).await? {
                BreakReason::ReachedTargetCycle => {
                    current_cycle = target;
                    if current_cycle.saturating_sub(starting_cycle) >= self.budget.max {
                        return Err(RollupError::ReachedLimitCycles {
                            limit: self.budget.max,
                        });
                    }
                }
                BreakReason::YieldedManually => return Ok(YieldKind::Manual),
                BreakReason::YieldedAutomatically => return Ok(YieldKind::Automatic),
                BreakReason::YieldedSoftly => return Err(RollupError::YieldedSoftly),
                BreakReason::Halted => return Err(RollupError::Halted),
                BreakReason::Failed => return Err(RollupError::Failed),
            }
        }
    }

    /// Yield reason currently latched in the `tohost` register.
    async fn read_yield_reason(&self) -> RollupResult<YieldReason> {
        let tohost = self.binding.read_htif_tohost_data().await?;
        Ok(YieldReason::from_u32(htif::tohost_reason(tohost))?)
    }

    /// Reads one emission from the tx buffer, sized by `tohost`.
    async fn read_emission(&self) -> RollupResult<Vec<u8>> {
        let tohost = self.binding.read_htif_tohost_data().await?;
        let length = u64::from(htif::tohost_length(tohost));
        let buffers = self.buffers();
        Ok(self.binding.read_memory(buffers.tx_buffer_start, length).await?)
    }

    /// Priming invariant: manual yield flag set, yield reason `RxAccepted`.
    async fn check_primed(&self) -> RollupResult<()> {
        if !self.binding.read_iflags_y().await? {
            return Err(RollupError::NotAtManualYield);
        }
        match self.read_yield_reason().await? {
            YieldReason::RxAccepted => Ok(()),
            YieldReason::RxRejected => Err(RollupError::LastInputWasRejected {
                emissions: Emissions::default(),
            }),
            YieldReason::TxException => Err(RollupError::LastInputYieldedAnException {
                emissions: Emissions::default(),
            }),
            other => Err(RollupError::UnexpectedYieldReason {
                context: "priming check",
                reason: other,
            }),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
