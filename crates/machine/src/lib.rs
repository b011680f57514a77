//! Machine layer: drive a remote, forkable, deterministic VM through the
//! rollup request protocol.
//!
//! ## Modules
//!
//! - [`bindings`]: the [`MachineBinding`] trait and wire-level types
//! - [`cartesi`]: JSON-RPC binding to a real machine manager process
//! - [`emulated`]: in-process binding emulating a manager fleet, for tests
//! - [`htif`]: `fromhost`/`tohost` register packing
//! - [`pmutex`]: two-priority async mutex guarding the live handle
//! - [`rollup`]: [`RollupMachine`], the request/emission driver
//! - [`runner`]: [`MachineRunner`], fork-and-swap request orchestration
//!
//! ## Layering
//!
//! ```text
//!   MachineRunner          advance / inspect, lock discipline
//!        │
//!   RollupMachine          priming, process loop, cycle budgets
//!        │
//!   MachineBinding         registers, memory, run, fork
//!     ┌──┴──────┐
//!  CartesiMachine      EmulatedMachine
//!  (JSON-RPC)          (in-process, scripted)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use oren_machine::{CycleBudget, MachineRunner, RollupMachine};
//!
//! let machine = RollupMachine::load(
//!     "127.0.0.1:5000",
//!     "/var/snapshots/app",
//!     &Default::default(),
//!     CycleBudget::default(),
//! )
//! .await?;
//! let runner = MachineRunner::new(machine, 8);
//! let result = runner.advance(&encoded_input).await?;
//! ```

pub mod bindings;
pub mod cartesi;
pub mod emulated;
pub mod htif;
pub mod pmutex;
pub mod rollup;
pub mod runner;

pub use bindings::{
    BreakReason, BufferConfig, MachineBinding, MachineError, MachineResult, RequestKind,
    RuntimeConfig, YieldReason,
};
pub use cartesi::CartesiMachine;
pub use pmutex::{PriorityGuard, PriorityMutex};
pub use rollup::{
    CycleBudget, Emissions, RollupError, RollupMachine, RollupResult, DEFAULT_CYCLE_INCREMENT,
    DEFAULT_MAX_CYCLES_PER_REQUEST,
};
pub use runner::{MachineRunner, DEFAULT_INSPECT_CONCURRENCY};
