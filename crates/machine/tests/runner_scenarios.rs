//! # Runner Scenario Tests
//!
//! End-to-end runs of the fork-and-swap runner against the emulated
//! machine fleet:
//! - accepted inputs swap the live machine and hash their outputs
//! - emissions decode as rollup outputs
//! - rejections and exceptions leave the pre-input machine live
//! - cycle budgets bound wedged guests
//! - advances complete while inspect traffic is in flight

use oren_common::abi;
use oren_common::merkle::outputs_merkle;
use oren_common::types::{Hash32, Output};
use oren_machine::emulated::{EmulatedHost, EmulatedMachine, RequestScript};
use oren_machine::{CycleBudget, MachineRunner, RollupError, RollupMachine};
use std::sync::Arc;
use std::time::Duration;

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

async fn runner_with(
    host: &Arc<EmulatedHost>,
    scripts: Vec<RequestScript>,
    budget: CycleBudget,
) -> MachineRunner<EmulatedMachine> {
    let machine = RollupMachine::new(host.load(scripts), budget)
        .await
        .expect("loaded snapshot must be primed");
    MachineRunner::new(machine, 4)
}

// ════════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn accepted_input_swaps_the_machine() {
    let host = Arc::new(EmulatedHost::new());
    let runner = runner_with(
        &host,
        vec![RequestScript::new().then_accept()],
        CycleBudget::default(),
    )
    .await;
    let before = runner.endpoint().await.unwrap();

    let result = runner.advance(b"hi").await.unwrap();
    assert!(result.outputs.is_empty());
    assert!(result.reports.is_empty());
    assert_eq!(result.outputs_hash, Hash32::ZERO);
    assert_ne!(result.machine_hash, Hash32::ZERO);

    let after = runner.endpoint().await.unwrap();
    assert_ne!(after, before, "live machine must be the post-input fork");
    assert_eq!(host.endpoints(), vec![after]);
}

#[tokio::test]
async fn emitted_notice_decodes_from_outputs() {
    let host = Arc::new(EmulatedHost::new());
    let notice = abi::encode_notice(b"hello");
    let runner = runner_with(
        &host,
        vec![RequestScript::new().output(&notice).then_accept()],
        CycleBudget::default(),
    )
    .await;

    let result = runner.advance(b"say hello").await.unwrap();
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs_hash, outputs_merkle(&result.outputs));

    let decoded = abi::decode_output(&result.outputs[0]).unwrap();
    match decoded {
        Output::Notice { payload } => assert_eq!(payload, b"hello"),
        other => panic!("expected a notice, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_input_leaves_the_handle_unchanged() {
    let host = Arc::new(EmulatedHost::new());
    let runner = runner_with(
        &host,
        vec![RequestScript::new().then_reject()],
        CycleBudget::default(),
    )
    .await;
    let before = runner.endpoint().await.unwrap();

    let err = runner.advance(b"x").await.unwrap_err();
    assert!(matches!(err, RollupError::LastInputWasRejected { .. }), "{err:?}");
    assert_eq!(runner.endpoint().await.unwrap(), before);
    assert_eq!(host.endpoints(), vec![before]);

    // A separately loaded accepting snapshot advances normally afterwards.
    let accepting = runner_with(
        &host,
        vec![RequestScript::new().then_accept()],
        CycleBudget::default(),
    )
    .await;
    accepting.advance(b"y").await.unwrap();
}

#[tokio::test]
async fn exception_surfaces_with_emitted_notice() {
    let host = Arc::new(EmulatedHost::new());
    let notice = abi::encode_notice(b"partial work");
    let runner = runner_with(
        &host,
        vec![RequestScript::new().output(&notice).then_exception(b"guest panic")],
        CycleBudget::default(),
    )
    .await;

    let err = runner.advance(b"x").await.unwrap_err();
    match err {
        RollupError::LastInputYieldedAnException { emissions } => {
            assert_eq!(emissions.outputs, vec![notice]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(host.endpoints().len(), 1);
}

#[tokio::test]
async fn wedged_guest_is_cut_off_at_the_cycle_limit() {
    let host = Arc::new(EmulatedHost::new());
    let budget = CycleBudget {
        increment: 100_000,
        max: 1_000_000,
    };
    let runner = runner_with(&host, vec![RequestScript::new().run_forever()], budget).await;
    let before = runner.endpoint().await.unwrap();

    let err = runner.advance(b"spin").await.unwrap_err();
    match err {
        RollupError::ReachedLimitCycles { limit } => assert_eq!(limit, 1_000_000),
        other => panic!("unexpected error: {other:?}"),
    }

    // The wedged fork was discarded; the pre-input machine is still live
    // and a replay hits the same deterministic limit.
    assert_eq!(runner.endpoint().await.unwrap(), before);
    let err = runner.advance(b"spin").await.unwrap_err();
    assert!(matches!(err, RollupError::ReachedLimitCycles { .. }), "{err:?}");
}

#[tokio::test]
async fn advance_completes_amid_inspect_traffic() {
    let host = Arc::new(EmulatedHost::new());
    host.set_run_latency(Duration::from_millis(10));
    // Every request, regardless of which fork serves it and in which
    // order, must see the same script, so seed one per request.
    let script = RequestScript::new().report(b"state").then_accept();
    let runner = Arc::new(runner_with(&host, vec![script; 5], CycleBudget::default()).await);
    let before = runner.endpoint().await.unwrap();

    let mut inspects = Vec::new();
    for _ in 0..4 {
        let runner = Arc::clone(&runner);
        inspects.push(tokio::spawn(async move {
            runner.inspect(b"query").await
        }));
    }
    let advancer = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.advance(b"input").await })
    };

    let result = advancer.await.unwrap().unwrap();
    assert_eq!(result.reports, vec![b"state".to_vec()]);
    for inspect in inspects {
        let reports = inspect.await.unwrap().unwrap();
        assert_eq!(reports, vec![b"state".to_vec()]);
    }

    // All forks are gone and the live machine is the advanced one.
    assert_eq!(host.endpoints().len(), 1);
    assert_ne!(runner.endpoint().await.unwrap(), before);
}
