//! Tests for the submission engine: the upfront balance gate and the
//! no-job-row-on-rejection invariant.

use std::collections::HashMap;
use std::sync::Arc;

use mirage::config::Config;
use mirage::engine::{GenerationEngine, SubmitSpec};
use mirage::error::MirageError;
use mirage::jobs::store::PendingJobStore;
use mirage::ledger::{CreditLedger, PurchaseSource};
use mirage::providers::dispatch::SubmitDispatch;
use mirage::providers::{JobKind, Provider};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct Harness {
    engine: GenerationEngine,
    store: Arc<PendingJobStore>,
    ledger: Arc<CreditLedger>,
}

fn harness() -> Harness {
    // No provider credentials configured: any submission that passes the
    // balance gate is rejected before the network is ever touched.
    let config = Arc::new(Config {
        providers: HashMap::new(),
        callback_base_url: None,
        push_gateway_url: None,
        listen_addr: "127.0.0.1:0".to_string(),
    });
    let store = Arc::new(PendingJobStore::new());
    let ledger = Arc::new(CreditLedger::new());
    let engine = GenerationEngine::new(
        config,
        Arc::new(SubmitDispatch::new()),
        Arc::clone(&store),
        Arc::clone(&ledger),
    );
    Harness {
        engine,
        store,
        ledger,
    }
}

fn spec(cost: Decimal) -> SubmitSpec {
    SubmitSpec {
        provider: Provider::Fal,
        kind: JobKind::Image,
        model: "fal-ai/flux/dev".to_string(),
        prompt: "a lighthouse at dusk".to_string(),
        media_refs: vec![],
        aspect_ratio: None,
        options: serde_json::Map::new(),
        cost,
        device_token: None,
    }
}

#[tokio::test]
async fn submission_rejected_when_balance_cannot_cover_cost() {
    let h = harness();
    h.ledger
        .add_credits("u1", dec!(0.25), PurchaseSource::described("topup"))
        .unwrap();

    let err = h.engine.submit("u1", spec(dec!(0.50))).await.unwrap_err();
    match err {
        MirageError::InsufficientCredits { balance, requested } => {
            assert_eq!(balance, dec!(0.25));
            assert_eq!(requested, dec!(0.50));
        }
        other => panic!("expected InsufficientCredits, got {other:?}"),
    }

    // Rejected before dispatch: no job row, no ledger movement.
    assert!(h.store.list_for_user("u1", None).is_empty());
    assert_eq!(h.ledger.balance("u1"), dec!(0.25));
}

#[tokio::test]
async fn rejected_submission_creates_no_job_row() {
    let h = harness();
    h.ledger
        .add_credits("u1", dec!(1.00), PurchaseSource::described("topup"))
        .unwrap();

    let err = h.engine.submit("u1", spec(dec!(0.50))).await.unwrap_err();
    assert!(matches!(err, MirageError::Submission { .. }));
    assert!(h.store.list_for_user("u1", None).is_empty());
    assert_eq!(h.ledger.balance("u1"), dec!(1.00));
}

#[tokio::test]
async fn zero_cost_submission_skips_the_balance_gate() {
    let h = harness();

    // Balance is zero and so is the cost: the gate passes and the failure
    // comes from the unconfigured provider, not from credits.
    let err = h.engine.submit("u1", spec(Decimal::ZERO)).await.unwrap_err();
    match err {
        MirageError::Submission { message, .. } => {
            assert!(message.contains("not configured"));
        }
        other => panic!("expected Submission, got {other:?}"),
    }
    assert!(h.store.list_for_user("u1", None).is_empty());
}
