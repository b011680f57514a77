//! The rollup execution node.
//!
//! Everything above the machine runner lives here: configuration, the
//! repository surface, the advance loop, the inspect API, and claim
//! submission. The binary in `main.rs` wires these into a supervised
//! service tree; the library exists so integration tests can assemble
//! the same pieces around an emulated machine.
//!
//! ```text
//!   inbox ──▶ Advancer ──▶ MachineRunner ◀── inspect HTTP
//!                │               │
//!                ▼               ▼
//!           Repository      machine manager
//!                │
//!                ▼
//!            Claimer ──▶ TransactionSender
//! ```

pub mod advancer;
pub mod claims;
pub mod config;
pub mod inspector;
pub mod repository;

pub use advancer::Advancer;
pub use claims::{Claimer, MockTransactionSender, TransactionSender};
pub use config::{AuthConfig, ConfigError, NodeConfig};
pub use inspector::{inspect_router, InspectResponse, InspectStatus};
pub use repository::{
    ClaimRecord, InMemoryRepository, InputDisposition, ProcessedInput, Repository,
    RepositoryError, RepositoryResult,
};
