//! Tests for the job status notifier: progress heuristic, the cancellation
//! grace window, dismissal stickiness, and listener lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mirage::error::MirageError;
use mirage::jobs::store::{PendingJobStore, TransitionFields};
use mirage::jobs::{JobStatus, PendingJob};
use mirage::ledger::{CreditLedger, PurchaseSource};
use mirage::notifier::{is_polling_provider, progress_estimate, JobStatusNotifier, CANCEL_GRACE};
use mirage::providers::dispatch::SubmitDispatch;
use mirage::providers::{JobKind, Provider};
use mirage::push::{NullPushDispatch, PushDispatch};
use mirage::reconciler::{normalize_callback, Reconciler};
use rust_decimal_macros::dec;

struct Harness {
    store: Arc<PendingJobStore>,
    ledger: Arc<CreditLedger>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<JobStatusNotifier>,
}

fn harness() -> Harness {
    let store = Arc::new(PendingJobStore::new());
    let ledger = Arc::new(CreditLedger::new());
    let secrets: HashMap<Provider, String> = [(Provider::Fal, "fal-secret".to_string())].into();
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        Arc::new(NullPushDispatch) as Arc<dyn PushDispatch>,
        secrets,
    ));
    let notifier = Arc::new(JobStatusNotifier::new(
        Arc::clone(&store),
        Arc::clone(&reconciler),
        Arc::new(SubmitDispatch::new()),
        None,
    ));
    Harness {
        store,
        ledger,
        reconciler,
        notifier,
    }
}

fn job(user: &str, task: &str) -> PendingJob {
    PendingJob::new(user, task, Provider::Fal, JobKind::Image, dec!(0.50))
}

// ---------------------------------------------------------------------------
// Progress heuristic
// ---------------------------------------------------------------------------

#[test]
fn fresh_job_has_near_zero_progress() {
    let progress = progress_estimate(&job("u1", "t1"));
    assert!(progress >= 0.0);
    assert!(progress < 0.1);
}

#[test]
fn long_running_job_caps_below_one() {
    let mut stale = job("u1", "t1");
    stale.created_at = Utc::now() - chrono::Duration::hours(1);
    let progress = progress_estimate(&stale);
    assert!((progress - 0.95).abs() < f32::EPSILON);
}

#[test]
fn terminal_job_reports_full_progress() {
    let mut done = job("u1", "t1");
    done.status = JobStatus::Completed;
    assert_eq!(progress_estimate(&done), 1.0);

    let mut failed = job("u1", "t2");
    failed.status = JobStatus::Failed;
    assert_eq!(progress_estimate(&failed), 1.0);
}

#[test]
fn video_progress_advances_slower_than_image() {
    let elapsed = chrono::Duration::seconds(20);
    let mut image = job("u1", "t1");
    image.created_at = Utc::now() - elapsed;
    let mut video = job("u1", "t2");
    video.kind = JobKind::Video;
    video.created_at = Utc::now() - elapsed;
    assert!(progress_estimate(&image) > progress_estimate(&video));
}

// ---------------------------------------------------------------------------
// Cancellation grace window
// ---------------------------------------------------------------------------

#[test]
fn cancel_denied_inside_grace_window() {
    let h = harness();
    let created = h.store.create(job("u1", "t1")).unwrap();

    let err = h.notifier.cancel("u1", created.id).unwrap_err();
    assert!(matches!(err, MirageError::CancelNotAllowed(_)));
    assert!(!h.store.get(created.id).unwrap().user_cancelled);
}

#[test]
fn cancel_allowed_after_grace_elapses() {
    let h = harness();
    let mut old = job("u1", "t1");
    old.created_at = Utc::now() - chrono::Duration::from_std(CANCEL_GRACE).unwrap()
        - chrono::Duration::seconds(60);
    let created = h.store.create(old).unwrap();

    h.notifier.cancel("u1", created.id).unwrap();
    assert!(h.store.get(created.id).unwrap().user_cancelled);
}

#[test]
fn cancel_denied_for_terminal_jobs() {
    let h = harness();
    let mut old = job("u1", "t1");
    old.created_at = Utc::now() - chrono::Duration::minutes(10);
    let created = h.store.create(old).unwrap();
    h.store
        .transition("t1", JobStatus::Failed, TransitionFields::default())
        .unwrap();

    let err = h.notifier.cancel("u1", created.id).unwrap_err();
    assert!(matches!(err, MirageError::CancelNotAllowed(_)));
}

#[test]
fn cancel_scoped_to_owning_user() {
    let h = harness();
    let mut old = job("u1", "t1");
    old.created_at = Utc::now() - chrono::Duration::minutes(10);
    let created = h.store.create(old).unwrap();

    let err = h.notifier.cancel("intruder", created.id).unwrap_err();
    assert!(matches!(err, MirageError::JobNotFound(_)));
    assert!(!h.store.get(created.id).unwrap().user_cancelled);
}

// ---------------------------------------------------------------------------
// Listener lifecycle and dismissal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listener_mirrors_this_users_jobs_only() {
    let h = harness();
    h.notifier.start_listening("u1");
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.store.create(job("u1", "mine")).unwrap();
    h.store.create(job("u2", "theirs")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = h.notifier.notifications();
    assert_eq!(records.len(), 1);
    assert!(records[0].title.contains("image"));
    h.notifier.stop_listening();
}

#[tokio::test]
async fn stopped_listener_records_nothing() {
    let h = harness();
    h.notifier.start_listening("u1");
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.notifier.stop_listening();
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.store.create(job("u1", "t1")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.notifier.notifications().is_empty());
}

#[tokio::test]
async fn late_completion_settles_but_never_resurrects_a_dismissed_job() {
    let h = harness();
    h.ledger
        .add_credits("u1", dec!(1.00), PurchaseSource::described("topup"))
        .unwrap();

    let mut old = job("u1", "t1");
    old.created_at = Utc::now() - chrono::Duration::minutes(10);
    let created = h.store.create(old).unwrap();

    h.notifier.start_listening("u1");
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.notifier.cancel("u1", created.id).unwrap();

    // Provider completes anyway; the webhook path still runs.
    let body = serde_json::json!({
        "request_id": "t1",
        "status": "OK",
        "payload": {"images": [{"url": "https://cdn.fal.media/out.png"}]}
    });
    let callback = normalize_callback(Provider::Fal, &body).unwrap();
    h.reconciler.reconcile(Provider::Fal, callback).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Credits settled for the delivered result, but the user sees nothing.
    assert_eq!(h.ledger.balance("u1"), dec!(0.50));
    assert_eq!(h.store.get(created.id).unwrap().status, JobStatus::Completed);
    assert!(h.notifier.notifications().is_empty());
    h.notifier.stop_listening();
}

#[tokio::test]
async fn terminal_update_marks_full_progress_and_thumbnail() {
    let h = harness();
    h.notifier.start_listening("u1");
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.store.create(job("u1", "t1")).unwrap();
    h.store
        .transition(
            "t1",
            JobStatus::Completed,
            TransitionFields {
                result_url: Some("https://cdn.fal.media/out.png".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = h.notifier.notifications();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].progress, 1.0);
    assert_eq!(
        records[0].thumbnail_url.as_deref(),
        Some("https://cdn.fal.media/out.png")
    );
    h.notifier.stop_listening();
}

// ---------------------------------------------------------------------------
// Polling classification
// ---------------------------------------------------------------------------

#[test]
fn only_the_synchronous_provider_polls() {
    assert!(is_polling_provider(Provider::Luma));
    assert!(!is_polling_provider(Provider::Fal));
    assert!(!is_polling_provider(Provider::Runway));
}
