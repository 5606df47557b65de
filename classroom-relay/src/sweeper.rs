//! Cleanup Sweeper (spec §4.4): the periodic task that advances session
//! lifecycle and reconciles the allocator and durable storage. Also
//! invokable on demand from the administrative surface (spec §6.3).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::model::{ConnectionId, ExpiryReason, SessionId};
use crate::providers::{Repository, SessionEndRecord};
use crate::registry::Registry;

/// Structured sweep metrics (spec §4.4 step 4's "{activeSessions,
/// expiredThisTick, reusableCodes}"), also returned as the JSON body of
/// `POST /sessions/cleanup-now` (spec §6.3).
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SweepReport {
    #[serde(rename = "activeSessions")]
    pub active_sessions: usize,
    #[serde(rename = "expiredThisTick")]
    pub expired_this_tick: usize,
    #[serde(rename = "reusableCodes")]
    pub reusable_codes: usize,
}

/// Callback the sweeper uses to tell connected clients their session
/// just expired (spec §4.3 "expiry emits `session.expired` to all live
/// student/teacher connections"). Implemented by the connection gateway;
/// kept as a trait here so the sweeper has no direct dependency on the
/// transport layer.
#[async_trait]
pub trait ExpiryNotifier: Send + Sync {
    async fn notify_session_expired(
        &self,
        session_id: SessionId,
        reason: ExpiryReason,
        teacher: Option<ConnectionId>,
        students: Vec<ConnectionId>,
    );
}

/// A notifier that does nothing, for standalone registry/sweeper tests.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl ExpiryNotifier for NullNotifier {
    async fn notify_session_expired(
        &self,
        _session_id: SessionId,
        _reason: ExpiryReason,
        _teacher: Option<ConnectionId>,
        _students: Vec<ConnectionId>,
    ) {
    }
}

/// Periodic reconciliation of timers, the code allocator, and storage.
pub struct Sweeper {
    registry: Arc<Registry>,
    repository: Arc<dyn Repository>,
    notifier: Arc<dyn ExpiryNotifier>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        registry: Arc<Registry>,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn ExpiryNotifier>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            repository,
            notifier,
            interval,
        }
    }

    /// The configured tick interval, for the caller's `tokio::time::interval`.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep tick (spec §4.4 steps 1-4). Safe to call concurrently
    /// with the periodic loop since it only drives idempotent registry
    /// operations — the administrative on-demand trigger (spec §6.3) uses
    /// this directly.
    pub async fn run_once(&self) -> SweepReport {
        let reusable_codes = self.registry.drain_code_quarantine();
        let expired = self.registry.expire_due_sessions().await;

        for (session_id, reason) in &expired {
            let Some(session) = self.registry.get(*session_id) else {
                continue;
            };
            let (classroom_code, teacher_identity, teacher_connection, students, total_translations, peak_concurrent_students) = {
                let inner = session.lock().await;
                (
                    inner.classroom_code.clone(),
                    inner.teacher_identity.clone(),
                    inner.teacher_connection,
                    inner.students.keys().copied().collect::<Vec<_>>(),
                    inner.total_translations,
                    inner.peak_concurrent_students,
                )
            };

            self.notifier
                .notify_session_expired(*session_id, *reason, teacher_connection, students)
                .await;

            if let Err(err) = self
                .repository
                .end_session(SessionEndRecord {
                    session_id: *session_id,
                    reason: *reason,
                    total_translations,
                    peak_concurrent_students,
                })
                .await
            {
                warn!(session_id = %session_id, error = %err, "sweeper: failed to persist terminal record, will retry next tick");
            }

            self.registry.remove_session(*session_id);
            self.registry
                .finalize_removal(&classroom_code, teacher_identity.as_deref());
        }

        let report = SweepReport {
            active_sessions: self.registry.session_count(),
            expired_this_tick: expired.len(),
            reusable_codes,
        };
        info!(
            active_sessions = report.active_sessions,
            expired_this_tick = report.expired_this_tick,
            reusable_codes = report.reusable_codes,
            "sweep.tick"
        );
        report
    }

    /// Run the periodic sweep loop until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = &mut shutdown => {
                    info!("sweeper: shutting down, running final tick");
                    self.run_once().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_allocator::CodeAllocator;
    use crate::config::RelayConfig;
    use crate::model::ConnectionId;
    use crate::providers::MemoryRepository;

    fn test_registry() -> Arc<Registry> {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        Arc::new(Registry::new(allocator, config))
    }

    #[tokio::test]
    async fn sweep_reports_zero_when_nothing_is_due() {
        let registry = test_registry();
        let repo = Arc::new(MemoryRepository::new());
        let sweeper = Sweeper::new(
            registry.clone(),
            repo,
            Arc::new(NullNotifier),
            Duration::from_millis(50),
        );
        let report = sweeper.run_once().await;
        assert_eq!(report.expired_this_tick, 0);
    }

    #[tokio::test]
    async fn sweep_expires_and_removes_stale_sessions() {
        let registry = test_registry();
        let repo = Arc::new(MemoryRepository::new());
        registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let sweeper = Sweeper::new(
            registry.clone(),
            repo.clone(),
            Arc::new(NullNotifier),
            Duration::from_millis(50),
        );
        let report = sweeper.run_once().await;
        assert_eq!(report.expired_this_tick, 1);
        assert_eq!(report.active_sessions, 0);
        assert_eq!(repo.end_records().len(), 1);
    }
}
