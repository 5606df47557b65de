//! Administrative HTTP surface (spec §6.3): forced cleanup and
//! read-only diagnostics, separate from the client WebSocket gateway.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::model::{SessionId, SessionInner, SessionStateKind};
use crate::registry::Registry;
use crate::sweeper::{Sweeper, SweepReport};

#[derive(Clone)]
struct AdminState {
    registry: Arc<Registry>,
    sweeper: Arc<Sweeper>,
    config: Arc<RelayConfig>,
}

/// Build the admin router (spec §6.3). Mounted on a separate listener
/// from the client-facing gateway so operator tooling never competes
/// with the `max_connections` ceiling.
pub fn admin_router(registry: Arc<Registry>, sweeper: Arc<Sweeper>, config: Arc<RelayConfig>) -> Router {
    let state = AdminState {
        registry,
        sweeper,
        config,
    };
    Router::new()
        .route("/sessions/cleanup-now", post(cleanup_now))
        .route("/sessions/active", get(active_sessions))
        .route("/sessions/:id/status", get(session_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `POST /sessions/cleanup-now`: force an out-of-band sweep tick
/// (spec §6.3, independent of the sweeper's own schedule).
async fn cleanup_now(State(state): State<AdminState>) -> (StatusCode, Json<SweepReport>) {
    let report = state.sweeper.run_once().await;
    (StatusCode::OK, Json(report))
}

#[derive(Debug, Serialize)]
struct ActiveSessionSummary {
    #[serde(rename = "sessionId")]
    session_id: SessionId,
    #[serde(rename = "classroomCode")]
    classroom_code: String,
    state: SessionStateKind,
    #[serde(rename = "studentCount")]
    student_count: usize,
}

/// `GET /sessions/active`: a diagnostic snapshot of every non-expired
/// session (spec §6.3).
async fn active_sessions(
    State(state): State<AdminState>,
) -> (StatusCode, Json<Vec<ActiveSessionSummary>>) {
    let mut summaries = Vec::new();
    for entry in state.registry.snapshot_sessions() {
        let inner = entry.lock().await;
        if inner.state == SessionStateKind::Expired {
            continue;
        }
        summaries.push(ActiveSessionSummary {
            session_id: entry.id,
            classroom_code: inner.classroom_code.as_str().to_string(),
            state: inner.state,
            student_count: inner.students.len(),
        });
    }
    (StatusCode::OK, Json(summaries))
}

#[derive(Debug, Serialize)]
struct StudentStatus {
    #[serde(rename = "connectionId")]
    connection_id: crate::model::ConnectionId,
    #[serde(rename = "targetLanguage")]
    target_language: String,
    #[serde(rename = "joinedAt")]
    joined_at: i64,
}

#[derive(Debug, Serialize)]
struct SessionStatus {
    #[serde(rename = "sessionId")]
    session_id: SessionId,
    #[serde(rename = "classroomCode")]
    classroom_code: String,
    state: SessionStateKind,
    #[serde(rename = "studentCount")]
    student_count: usize,
    #[serde(rename = "totalTranslations")]
    total_translations: u64,
    #[serde(rename = "peakConcurrentStudents")]
    peak_concurrent_students: usize,
    students: Vec<StudentStatus>,
    /// Milliseconds until `T_stale` fires for this session, clamped to 0
    /// (spec §9 Design Notes decides this endpoint carries per-student
    /// `joinedAt`/`targetLanguage` plus a timer-remaining field).
    #[serde(rename = "staleTimerRemainingMs")]
    stale_timer_remaining_ms: u64,
}

fn epoch_millis(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn stale_timer_remaining_ms(inner: &SessionInner, stale_timeout: std::time::Duration) -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(inner.last_activity_at)
        .unwrap_or_default();
    stale_timeout.saturating_sub(elapsed).as_millis() as u64
}

/// `GET /sessions/{id}/status`: detail view for one session (spec §6.3).
async fn session_status(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, StatusCode> {
    let session_id = SessionId(id);
    let Some(session) = state.registry.get(session_id) else {
        warn!(%session_id, "admin: status requested for unknown session");
        return Err(StatusCode::NOT_FOUND);
    };
    let inner = session.lock().await;
    let students = inner
        .students
        .values()
        .map(|sub| StudentStatus {
            connection_id: sub.connection_id,
            target_language: sub.target_language.clone(),
            joined_at: epoch_millis(sub.joined_at),
        })
        .collect();
    Ok(Json(SessionStatus {
        session_id,
        classroom_code: inner.classroom_code.as_str().to_string(),
        state: inner.state,
        student_count: inner.students.len(),
        total_translations: inner.total_translations,
        peak_concurrent_students: inner.peak_concurrent_students,
        students,
        stale_timer_remaining_ms: stale_timer_remaining_ms(&inner, state.config.session_stale_timeout),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_allocator::CodeAllocator;
    use crate::config::RelayConfig;
    use crate::gateway::{ConnectionDirectory, GatewayExpiryNotifier};
    use crate::model::ConnectionId;
    use crate::providers::MemoryRepository;

    fn test_state() -> AdminState {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config.clone()));
        let connections = Arc::new(ConnectionDirectory::new(config.send_queue_depth));
        let notifier = Arc::new(GatewayExpiryNotifier::new(connections));
        let repository = Arc::new(MemoryRepository::new());
        let sweeper = Arc::new(Sweeper::new(
            registry.clone(),
            repository,
            notifier,
            config.session_cleanup_interval,
        ));
        AdminState {
            registry,
            sweeper,
            config,
        }
    }

    #[tokio::test]
    async fn active_sessions_excludes_expired() {
        let state = test_state();
        state
            .registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        let (_, Json(summaries)) = active_sessions(State(state)).await;
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test]
    async fn session_status_404s_for_unknown_id() {
        let state = test_state();
        let result = session_status(State(state), Path(Uuid::new_v4())).await;
        assert!(result.is_err());
    }
}
