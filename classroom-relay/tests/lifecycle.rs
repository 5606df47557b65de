//! Session lifecycle and registry invariant tests (spec §8 S4-S5 and
//! quantified invariants 1-2), driven through the sweeper the way the
//! administrative `cleanup-now` endpoint and periodic tick do.

mod common;

use std::sync::Arc;
use std::time::Duration;

use classroom_relay::gateway::GatewayExpiryNotifier;
use classroom_relay::model::ExpiryReason;
use classroom_relay::protocol::Outbound;
use classroom_relay::sweeper::Sweeper;
use common::Harness;

fn sweeper_for(harness: &Harness) -> Sweeper {
    let notifier = Arc::new(GatewayExpiryNotifier::new(harness.connections.clone()));
    Sweeper::new(
        harness.registry.clone(),
        harness.repo.clone(),
        notifier,
        harness.config.session_cleanup_interval,
    )
}

#[tokio::test]
async fn s4_empty_teacher_session_expires_and_code_becomes_invalid() {
    let harness = Harness::new();
    let (teacher, code) = harness.register_teacher("teacher-1", "en-US").await;

    // `sessionEmptyTeacherTimeout` is 2s under test defaults; no student
    // ever joins.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let sweeper = sweeper_for(&harness);
    let report = sweeper.run_once().await;
    assert_eq!(report.expired_this_tick, 1);

    match teacher.recv().await {
        Outbound::Error { .. } | Outbound::SessionExpired { .. } => {}
        other => panic!("expected the teacher connection to be notified, got {other:?}"),
    }

    // A late `register{classroomCode}` would receive `error{code:
    // "classroom_expired"}` from the router; assert the same outcome
    // directly against the registry the router consults.
    let resolve = harness
        .registry
        .resolve_code(&classroom_relay::model::ClassroomCode::parse(&code).unwrap());
    assert!(resolve.is_err());
}

#[tokio::test]
async fn s5_students_left_session_expires_after_timeout() {
    let harness = Harness::new();
    let (_, code) = harness.register_teacher("teacher-1", "en-US").await;
    let student = harness.register_student(&code, "es-ES").await;
    let session_id = harness.registry.snapshot_sessions()[0].id;

    harness.registry.student_disconnected(session_id, student.id).await;

    // `sessionStudentsLeftTimeout` is 2s under test defaults.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let sweeper = sweeper_for(&harness);
    let report = sweeper.run_once().await;
    assert_eq!(report.expired_this_tick, 1);

    let expired = harness
        .repo
        .end_records()
        .into_iter()
        .any(|r| r.reason == ExpiryReason::StudentsLeft);
    assert!(expired, "expected an end_session record with reason StudentsLeft");
}

#[tokio::test]
async fn invariant_classroom_codes_are_unique_across_active_sessions() {
    let harness = Harness::new();
    let mut codes = Vec::new();
    for i in 0..10 {
        let (_, code) = harness.register_teacher(&format!("teacher-{i}"), "en-US").await;
        codes.push(code);
    }
    let mut sorted = codes.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), codes.len());
}

#[tokio::test]
async fn invariant_removed_session_code_is_released_not_dangling() {
    let harness = Harness::new();
    let (_, code) = harness.register_teacher("teacher-1", "en-US").await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let sweeper = sweeper_for(&harness);
    sweeper.run_once().await;

    let parsed = classroom_relay::model::ClassroomCode::parse(&code).unwrap();
    // The code no longer resolves to the removed session...
    assert!(harness.registry.resolve_code(&parsed).is_err());
    // ...and a fresh teacher can eventually be allocated a session again
    // without the allocator considering the old code permanently taken.
    let (_, new_code) = harness.register_teacher("teacher-2", "en-US").await;
    assert!(!new_code.is_empty());
}
