//! Repository surface consumed by the advance loop and the claimer.
//!
//! The node treats storage as opaque: inputs come out ordered by inbox
//! index, results and claims go back in. [`InMemoryRepository`] is the
//! only backing store shipped here; it drives the tests and the mock
//! bring-up, and it doubles as the reference semantics a persistent
//! backend would have to match.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use oren_common::{AdvanceResult, Claim, Input};

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    /// A write referenced an application the store has never seen.
    #[error("unknown application `{0}`")]
    UnknownApplication(String),

    /// A claim write referenced an epoch with no stored claim.
    #[error("no claim stored for epoch {0}")]
    UnknownClaim(u64),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

// ════════════════════════════════════════════════════════════════════════════
// REPOSITORY TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Storage operations the node needs, keyed by application.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Inputs not yet processed, ordered by inbox index.
    async fn unprocessed_inputs(&self, app: &str) -> RepositoryResult<Vec<Input>>;

    /// Records an accepted input together with everything the machine
    /// produced for it.
    async fn save_advance_result(
        &self,
        app: &str,
        input: &Input,
        result: &AdvanceResult,
    ) -> RepositoryResult<()>;

    /// Records an input the machine refused; it will not be retried.
    async fn mark_input_rejected(
        &self,
        app: &str,
        input: &Input,
        reason: &str,
    ) -> RepositoryResult<()>;

    /// Stores a computed epoch claim for later submission.
    async fn save_claim(&self, app: &str, claim: &Claim) -> RepositoryResult<()>;

    /// Claims computed but not yet submitted, oldest epoch first.
    async fn unsubmitted_claims(&self, app: &str) -> RepositoryResult<Vec<Claim>>;

    /// Marks a claim as submitted under the given transaction hash.
    async fn mark_claim_submitted(
        &self,
        app: &str,
        epoch: u64,
        tx_hash: &str,
    ) -> RepositoryResult<()>;

    /// Index of the most recently processed input, if any.
    async fn latest_processed_index(&self, app: &str) -> RepositoryResult<Option<u64>>;
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

/// How a processed input left the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDisposition {
    Accepted(AdvanceResult),
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct ProcessedInput {
    pub input: Input,
    pub disposition: InputDisposition,
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    pub claim: Claim,
    /// Transaction hash once submitted.
    pub tx_hash: Option<String>,
}

#[derive(Debug, Default)]
struct AppState {
    pending: VecDeque<Input>,
    processed: Vec<ProcessedInput>,
    claims: Vec<ClaimRecord>,
}

/// Map-backed store for tests and the mock bring-up.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    apps: Mutex<HashMap<String, AppState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds an input into the application's inbox.
    pub fn enqueue_input(&self, app: &str, input: Input) {
        let mut apps = self.apps.lock();
        apps.entry(app.to_string()).or_default().pending.push_back(input);
    }

    /// Everything processed so far, in processing order.
    pub fn processed(&self, app: &str) -> Vec<ProcessedInput> {
        let apps = self.apps.lock();
        apps.get(app).map(|state| state.processed.clone()).unwrap_or_default()
    }

    /// Every stored claim, oldest first.
    pub fn claims(&self, app: &str) -> Vec<ClaimRecord> {
        let apps = self.apps.lock();
        apps.get(app).map(|state| state.claims.clone()).unwrap_or_default()
    }

    fn with_app<R>(
        &self,
        app: &str,
        f: impl FnOnce(&mut AppState) -> RepositoryResult<R>,
    ) -> RepositoryResult<R> {
        let mut apps = self.apps.lock();
        let state = apps
            .get_mut(app)
            .ok_or_else(|| RepositoryError::UnknownApplication(app.to_string()))?;
        f(state)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn unprocessed_inputs(&self, app: &str) -> RepositoryResult<Vec<Input>> {
        let apps = self.apps.lock();
        Ok(apps
            .get(app)
            .map(|state| state.pending.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_advance_result(
        &self,
        app: &str,
        input: &Input,
        result: &AdvanceResult,
    ) -> RepositoryResult<()> {
        self.with_app(app, |state| {
            state.pending.retain(|pending| pending.index != input.index);
            state.processed.push(ProcessedInput {
                input: input.clone(),
                disposition: InputDisposition::Accepted(result.clone()),
            });
            Ok(())
        })
    }

    async fn mark_input_rejected(
        &self,
        app: &str,
        input: &Input,
        reason: &str,
    ) -> RepositoryResult<()> {
        self.with_app(app, |state| {
            state.pending.retain(|pending| pending.index != input.index);
            state.processed.push(ProcessedInput {
                input: input.clone(),
                disposition: InputDisposition::Rejected {
                    reason: reason.to_string(),
                },
            });
            Ok(())
        })
    }

    async fn save_claim(&self, app: &str, claim: &Claim) -> RepositoryResult<()> {
        self.with_app(app, |state| {
            state.claims.push(ClaimRecord {
                claim: claim.clone(),
                tx_hash: None,
            });
            Ok(())
        })
    }

    async fn unsubmitted_claims(&self, app: &str) -> RepositoryResult<Vec<Claim>> {
        let apps = self.apps.lock();
        Ok(apps
            .get(app)
            .map(|state| {
                state
                    .claims
                    .iter()
                    .filter(|record| record.tx_hash.is_none())
                    .map(|record| record.claim.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_claim_submitted(
        &self,
        app: &str,
        epoch: u64,
        tx_hash: &str,
    ) -> RepositoryResult<()> {
        self.with_app(app, |state| {
            let record = state
                .claims
                .iter_mut()
                .find(|record| record.claim.epoch == epoch)
                .ok_or(RepositoryError::UnknownClaim(epoch))?;
            record.tx_hash = Some(tx_hash.to_string());
            Ok(())
        })
    }

    async fn latest_processed_index(&self, app: &str) -> RepositoryResult<Option<u64>> {
        let apps = self.apps.lock();
        Ok(apps
            .get(app)
            .and_then(|state| state.processed.last())
            .map(|processed| processed.input.index))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use oren_common::{Address, Hash32};

    fn input(index: u64) -> Input {
        Input {
            sender: Address::from_bytes([0x11; 20]),
            block_number: index * 10,
            block_timestamp: 1_700_000_000 + index,
            index,
            payload: vec![index as u8],
        }
    }

    fn result() -> AdvanceResult {
        AdvanceResult {
            outputs: Vec::new(),
            reports: Vec::new(),
            outputs_hash: Hash32::ZERO,
            machine_hash: Hash32::digest(b"state"),
        }
    }

    #[tokio::test]
    async fn inputs_come_back_in_index_order() {
        let repo = InMemoryRepository::new();
        repo.enqueue_input("dapp", input(0));
        repo.enqueue_input("dapp", input(1));
        repo.enqueue_input("dapp", input(2));

        let pending = repo.unprocessed_inputs("dapp").await.unwrap();
        assert_eq!(
            pending.iter().map(|i| i.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(repo.unprocessed_inputs("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saving_a_result_consumes_the_input() {
        let repo = InMemoryRepository::new();
        repo.enqueue_input("dapp", input(0));
        repo.enqueue_input("dapp", input(1));

        repo.save_advance_result("dapp", &input(0), &result()).await.unwrap();

        let pending = repo.unprocessed_inputs("dapp").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 1);
        assert_eq!(repo.latest_processed_index("dapp").await.unwrap(), Some(0));
        assert!(matches!(
            repo.processed("dapp")[0].disposition,
            InputDisposition::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn rejection_records_the_reason() {
        let repo = InMemoryRepository::new();
        repo.enqueue_input("dapp", input(4));
        repo.mark_input_rejected("dapp", &input(4), "machine rejected the input")
            .await
            .unwrap();

        let processed = repo.processed("dapp");
        assert_eq!(processed.len(), 1);
        assert!(matches!(
            &processed[0].disposition,
            InputDisposition::Rejected { reason } if reason.contains("rejected")
        ));
        assert!(repo.unprocessed_inputs("dapp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_to_unknown_applications_fail() {
        let repo = InMemoryRepository::new();
        let error = repo
            .save_advance_result("ghost", &input(0), &result())
            .await
            .unwrap_err();
        assert!(matches!(error, RepositoryError::UnknownApplication(app) if app == "ghost"));
    }

    #[tokio::test]
    async fn claims_move_from_pending_to_submitted() {
        let repo = InMemoryRepository::new();
        repo.enqueue_input("dapp", input(0));
        let claim = Claim {
            epoch: 0,
            first_index: 0,
            last_index: 4,
            claim_hash: Hash32::digest(b"outputs"),
        };
        repo.save_claim("dapp", &claim).await.unwrap();
        assert_eq!(repo.unsubmitted_claims("dapp").await.unwrap(), vec![claim]);

        repo.mark_claim_submitted("dapp", 0, "0xabc").await.unwrap();
        assert!(repo.unsubmitted_claims("dapp").await.unwrap().is_empty());
        assert_eq!(repo.claims("dapp")[0].tx_hash.as_deref(), Some("0xabc"));

        let missing = repo.mark_claim_submitted("dapp", 9, "0xdef").await.unwrap_err();
        assert!(matches!(missing, RepositoryError::UnknownClaim(9)));
    }
}
