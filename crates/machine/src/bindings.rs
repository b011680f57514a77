//! # Machine Binding Contract
//!
//! Backend-agnostic interface to a remote, forkable deterministic machine.
//! The machine manager runs as a separate process (one per machine), serves
//! a small RPC surface, and can fork itself into an independently addressed
//! child process with identical state.
//!
//! ## Implementations
//!
//! | Backend | Status | Transport |
//! |---------|--------|-----------|
//! | [`CartesiMachine`](crate::cartesi::CartesiMachine) | Production | JSON-RPC over HTTP |
//! | [`EmulatedMachine`](crate::emulated::EmulatedMachine) | Testing / mock mode | In-process table |
//!
//! ## Contract
//!
//! - Methods perform remote I/O and are not interruptible; once issued they
//!   complete or fail on their own.
//! - Every failure surfaces as a [`MachineError`]; no method panics.
//! - `fork` must leave the source machine untouched: `read_mcycle` and
//!   `read_iflags_y` on the source return the same values before and after.
//! - `connect` attaches to an already-loaded machine; it must not alter
//!   that machine's state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use oren_common::Hash32;

// ════════════════════════════════════════════════════════════════════════════
// SUPPORTING TYPES
// ════════════════════════════════════════════════════════════════════════════

/// Why the machine stopped executing during a `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// Unrecoverable machine fault.
    Failed,
    /// The guest program terminated.
    Halted,
    /// Yield instruction with the manual flag set; the serialization point
    /// between requests.
    YieldedManually,
    /// Yield instruction without the manual flag; used for emissions and
    /// progress checkpoints.
    YieldedAutomatically,
    /// Soft yield; the driver treats it as an error for rollup workloads.
    YieldedSoftly,
    /// `mcycle` reached the requested target with no yield or halt.
    ReachedTargetCycle,
}

impl BreakReason {
    /// Parses the wire representation used by the machine manager.
    pub fn parse(value: &str) -> Result<Self, MachineError> {
        match value {
            "failed" => Ok(BreakReason::Failed),
            "halted" => Ok(BreakReason::Halted),
            "yielded_manually" => Ok(BreakReason::YieldedManually),
            "yielded_automatically" => Ok(BreakReason::YieldedAutomatically),
            "yielded_softly" => Ok(BreakReason::YieldedSoftly),
            "reached_target_cycle" => Ok(BreakReason::ReachedTargetCycle),
            other => Err(MachineError::UnknownBreakReason {
                value: other.to_string(),
            }),
        }
    }

    /// Wire representation used by the machine manager.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakReason::Failed => "failed",
            BreakReason::Halted => "halted",
            BreakReason::YieldedManually => "yielded_manually",
            BreakReason::YieldedAutomatically => "yielded_automatically",
            BreakReason::YieldedSoftly => "yielded_softly",
            BreakReason::ReachedTargetCycle => "reached_target_cycle",
        }
    }
}

/// Why the machine yielded, read from the high 32 bits of `tohost`.
///
/// `Progress`, `TxOutput` and `TxReport` accompany automatic yields;
/// `RxAccepted`, `RxRejected` and `TxException` accompany manual yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum YieldReason {
    Progress = 0,
    RxAccepted = 1,
    RxRejected = 2,
    TxOutput = 3,
    TxReport = 4,
    TxException = 5,
}

impl YieldReason {
    /// Maps the raw register discriminant, rejecting unknown values.
    pub fn from_u32(value: u32) -> Result<Self, MachineError> {
        match value {
            0 => Ok(YieldReason::Progress),
            1 => Ok(YieldReason::RxAccepted),
            2 => Ok(YieldReason::RxRejected),
            3 => Ok(YieldReason::TxOutput),
            4 => Ok(YieldReason::TxReport),
            5 => Ok(YieldReason::TxException),
            other => Err(MachineError::UnknownYieldReason { value: other }),
        }
    }
}

/// Kind of request injected through `fromhost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    Advance = 0,
    Inspect = 1,
}

/// Memory-mapped I/O buffer addresses, read once from the machine's initial
/// configuration and cached for the lifetime of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Start of the receive buffer (requests are written here).
    pub rx_buffer_start: u64,
    /// Start of the transmit buffer (emissions are read from here).
    pub tx_buffer_start: u64,
}

/// Runtime options passed to the machine manager at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Suppress guest console output in the manager's logs.
    #[serde(default)]
    pub no_console_putchar: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Errors from machine binding operations.
///
/// Remote failures carry the manager's error code and message; transport
/// failures carry the endpoint so log lines identify the process.
#[derive(Error, Debug)]
pub enum MachineError {
    /// Could not reach the machine manager at all.
    #[error("transport failure talking to machine at {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The manager answered with a structured error.
    #[error("machine call `{method}` failed with code {code}: {message}")]
    Call {
        method: String,
        code: i64,
        message: String,
    },

    /// The manager answered, but not with anything parseable.
    #[error("malformed response to `{method}`: {reason}")]
    BadResponse { method: String, reason: String },

    /// `tohost` carried a yield reason outside the contract.
    #[error("unknown yield reason {value:#x} in tohost register")]
    UnknownYieldReason { value: u32 },

    /// `run` reported a break reason outside the contract.
    #[error("unknown break reason `{value}`")]
    UnknownBreakReason { value: String },

    /// No machine is loaded at the given endpoint.
    #[error("no machine loaded at {endpoint}")]
    NotFound { endpoint: String },
}

/// Result type alias for binding operations.
pub type MachineResult<T> = Result<T, MachineError>;

// ════════════════════════════════════════════════════════════════════════════
// BINDING TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Operations every machine backend must provide.
///
/// Read methods take `&self`; anything that changes machine state takes
/// `&mut self`, which matches the driver's exclusive-ownership model (one
/// live handle, guarded by the priority mutex). `fork`, `connect` and
/// `shutdown_endpoint` are topology operations on the manager and leave the
/// handle itself untouched.
#[async_trait]
pub trait MachineBinding: Send + Sync + Sized + 'static {
    /// Address of the remote process this handle is bound to.
    fn endpoint(&self) -> &str;

    /// Cached I/O buffer addresses.
    fn buffer_config(&self) -> BufferConfig;

    /// Steps the machine until `mcycle >= target_cycle` or a yield, halt
    /// or fault, whichever comes first.
    async fn run(&mut self, target_cycle: u64) -> MachineResult<BreakReason>;

    /// Current value of the machine cycle counter.
    async fn read_mcycle(&self) -> MachineResult<u64>;

    /// Whether the manual-yield flag is set.
    async fn read_iflags_y(&self) -> MachineResult<bool>;

    /// Clears the manual-yield flag, letting the machine resume.
    async fn reset_iflags_y(&mut self) -> MachineResult<()>;

    /// Data portion of the `tohost` register.
    async fn read_htif_tohost_data(&self) -> MachineResult<u64>;

    /// Raw `fromhost` register.
    async fn read_htif_fromhost(&self) -> MachineResult<u64>;

    /// Writes the data portion of the `fromhost` register.
    async fn write_htif_fromhost_data(&mut self, value: u64) -> MachineResult<()>;

    /// Reads `length` bytes of machine memory starting at `address`.
    async fn read_memory(&self, address: u64, length: u64) -> MachineResult<Vec<u8>>;

    /// Writes `data` into machine memory starting at `address`.
    async fn write_memory(&mut self, address: u64, data: &[u8]) -> MachineResult<()>;

    /// Merkle root hash of the machine state.
    async fn read_root_hash(&self) -> MachineResult<Hash32>;

    /// In-place checkpoint. The driver prefers `fork`; kept for managers
    /// that support cheap local snapshots.
    async fn snapshot(&mut self) -> MachineResult<()>;

    /// Restores the last `snapshot` checkpoint.
    async fn rollback(&mut self) -> MachineResult<()>;

    /// Asks the manager to fork. Returns the child's endpoint; the caller
    /// attaches with [`MachineBinding::connect`].
    async fn fork(&self) -> MachineResult<String>;

    /// Attaches to an already-loaded machine at `endpoint`, reusing this
    /// handle's transport context.
    async fn connect(&self, endpoint: &str) -> MachineResult<Self>;

    /// Terminates the remote process at `endpoint` without attaching.
    /// Used to reap a fork whose attach failed.
    async fn shutdown_endpoint(&self, endpoint: &str) -> MachineResult<()>;

    /// Destroys the loaded machine inside the remote process.
    async fn destroy(&mut self) -> MachineResult<()>;

    /// Terminates the remote process this handle is bound to.
    async fn shutdown(&mut self) -> MachineResult<()>;
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_reason_wire_roundtrip() {
        for reason in [
            BreakReason::Failed,
            BreakReason::Halted,
            BreakReason::YieldedManually,
            BreakReason::YieldedAutomatically,
            BreakReason::YieldedSoftly,
            BreakReason::ReachedTargetCycle,
        ] {
            assert_eq!(BreakReason::parse(reason.as_str()).unwrap(), reason);
        }
    }

    #[test]
    fn break_reason_rejects_unknown() {
        let err = BreakReason::parse("rebooted").unwrap_err();
        assert!(matches!(err, MachineError::UnknownBreakReason { .. }));
    }

    #[test]
    fn yield_reason_discriminants() {
        assert_eq!(YieldReason::from_u32(0).unwrap(), YieldReason::Progress);
        assert_eq!(YieldReason::from_u32(1).unwrap(), YieldReason::RxAccepted);
        assert_eq!(YieldReason::from_u32(2).unwrap(), YieldReason::RxRejected);
        assert_eq!(YieldReason::from_u32(3).unwrap(), YieldReason::TxOutput);
        assert_eq!(YieldReason::from_u32(4).unwrap(), YieldReason::TxReport);
        assert_eq!(YieldReason::from_u32(5).unwrap(), YieldReason::TxException);
        assert!(YieldReason::from_u32(6).is_err());
    }
}
