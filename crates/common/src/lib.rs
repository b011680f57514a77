//! # OREN Common Crate
//!
//! Shared building blocks for the rollup node.
//!
//! ## Modules
//! - `types`: domain value types (addresses, hashes, inputs, outputs)
//! - `abi`: request/emission ABI codec
//! - `merkle`: Keccak-256 output commitments
//! - `claim`: epoch arithmetic and claim construction
//!
//! ## Data Flow
//! ```text
//! Input ──encode_advance──▶ machine rx buffer
//!                             │ run
//! emissions ◀──tx buffer──────┘
//!     │ outputs_merkle            per input
//!     ▼
//! outputs_hash ──compute_claim──▶ claim_hash   per epoch
//! ```
//!
//! Everything here is pure and synchronous so both the machine driver and
//! the host services can use it without pulling in a runtime.
//!
//! ## Usage
//! ```rust,ignore
//! let encoded = abi::encode_advance(&input);
//! let outputs_hash = merkle::outputs_merkle(&outputs);
//! ```

pub mod abi;
pub mod claim;
pub mod merkle;
pub mod types;

pub use claim::Claim;
pub use types::{Address, AdvanceResult, Hash32, Input, Output, Query};
