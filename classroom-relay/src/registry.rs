//! Session Registry & Lifecycle Controller (spec §4.3).
//!
//! Owns the session table, the teacher-reconnect binding rule, and the
//! per-session expiration timers. Cross-session indices (`by_code`,
//! `by_teacher_identity`) are [`dashmap::DashMap`]s so lookups are short
//! critical sections; all mutable per-session state lives behind that
//! session's own `tokio::sync::Mutex`, mutated only by whichever task is
//! currently acting as its controller (spec §5 locking discipline).

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::code_allocator::{CodeAllocator, Resolution};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::model::{
    ClassroomCode, ConnectionId, ExpiryReason, SessionId, SessionInner, SessionStateKind,
    StudentSubscription, TtsPreference,
};

/// One session: an immutable id plus its mutex-guarded mutable state.
pub struct Session {
    pub id: SessionId,
    inner: Mutex<SessionInner>,
    /// Cancelled once this session transitions to `Expired` (spec §4.6
    /// "Cancellation"), so in-flight translation/TTS jobs for it can stop
    /// promptly instead of running to completion against a dead session.
    cancellation: CancellationToken,
}

impl Session {
    /// Lock this session's mutable state. Callers must treat themselves
    /// as the single writer for the duration of the guard (spec §5).
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// This session's cancellation token, cloned so callers can hold it
    /// across `.await` points without holding `inner`'s lock.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Outcome of handling a teacher `register` request (spec §4.3).
pub struct TeacherBinding {
    pub session_id: SessionId,
    pub classroom_code: ClassroomCode,
    /// True if an existing session was rebound rather than created.
    pub resumed: bool,
}

/// The in-memory session table and its indices.
pub struct Registry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_code: DashMap<String, SessionId>,
    by_teacher_identity: DashMap<String, SessionId>,
    allocator: Arc<CodeAllocator>,
    config: Arc<RelayConfig>,
}

impl Registry {
    pub fn new(allocator: Arc<CodeAllocator>, config: Arc<RelayConfig>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_code: DashMap::new(),
            by_teacher_identity: DashMap::new(),
            allocator,
            config,
        }
    }

    /// Number of sessions currently held, for the capacity ceiling check
    /// (spec §5 "ceilings on... sessions").
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drain the code allocator's one-tick quarantine (spec §4.4 step 1).
    /// Returns how many codes became reusable this tick.
    pub fn drain_code_quarantine(&self) -> usize {
        self.allocator.drain_quarantine()
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    /// Snapshot of every session handle currently held, for read-only
    /// diagnostic surfaces (spec §6.3 `GET /sessions/active`).
    pub fn snapshot_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    /// Resolve a classroom code to its session, applying the
    /// `classroom_invalid` / `classroom_expired` distinction from spec §7.
    pub fn resolve_code(&self, code: &ClassroomCode) -> Result<Arc<Session>> {
        match self.allocator.resolve(code) {
            Ok(session_id) => self
                .sessions
                .get(&session_id)
                .map(|entry| entry.clone())
                .ok_or_else(|| Error::ClassroomExpired(code.as_str().to_string())),
            Err(Resolution::NotFound) => Err(Error::ClassroomInvalid(code.as_str().to_string())),
            Err(Resolution::Expired) => Err(Error::ClassroomExpired(code.as_str().to_string())),
        }
    }

    /// Handle an authenticated teacher connecting (spec §4.3 "Teacher
    /// reconnection rule"). Rebinds to a resumable session owned by the
    /// same identity if one exists in `{Active, Draining}` with a
    /// non-expired code; otherwise allocates a brand new session.
    pub async fn register_teacher(
        &self,
        teacher_identity: String,
        teacher_language: String,
        connection_id: ConnectionId,
    ) -> Result<TeacherBinding> {
        if let Some(existing_id) = self.by_teacher_identity.get(&teacher_identity).map(|e| *e) {
            if let Some(session) = self.sessions.get(&existing_id).map(|e| e.clone()) {
                let mut inner = session.lock().await;
                let resumable = matches!(
                    inner.state,
                    SessionStateKind::Active | SessionStateKind::Draining
                ) && self.allocator.resolve(&inner.classroom_code).is_ok();
                if resumable {
                    inner.teacher_connection = Some(connection_id);
                    inner.teacher_connected_at = Some(SystemTime::now());
                    inner.teacher_gone_since = None;
                    inner.state = SessionStateKind::Active;
                    inner.touch_activity();
                    let classroom_code = inner.classroom_code.clone();
                    info!(session_id = %existing_id, code = %classroom_code, "session.resumed");
                    return Ok(TeacherBinding {
                        session_id: existing_id,
                        classroom_code,
                        resumed: true,
                    });
                }
            }
        }

        if self.sessions.len() >= self.config.max_sessions {
            return Err(Error::Capacity);
        }

        let session_id = SessionId::new();
        let classroom_code = self.allocator.allocate(session_id);
        let inner = SessionInner::new(
            classroom_code.clone(),
            teacher_identity.clone(),
            teacher_language,
            connection_id,
        );
        let session = Arc::new(Session {
            id: session_id,
            inner: Mutex::new(inner),
            cancellation: CancellationToken::new(),
        });
        self.sessions.insert(session_id, session);
        self.by_code
            .insert(classroom_code.as_str().to_string(), session_id);
        self.by_teacher_identity.insert(teacher_identity, session_id);

        info!(session_id = %session_id, code = %classroom_code, "session.created");
        Ok(TeacherBinding {
            session_id,
            classroom_code,
            resumed: false,
        })
    }

    /// Handle a student `register` request: resolve the code, verify the
    /// session is accepting joins, and add the subscription.
    pub async fn register_student(
        &self,
        code: &ClassroomCode,
        connection_id: ConnectionId,
        target_language: String,
        tts_preference: TtsPreference,
    ) -> Result<(SessionId, String)> {
        let session = self.resolve_code(code)?;
        let mut inner = session.lock().await;
        if !matches!(
            inner.state,
            SessionStateKind::Active | SessionStateKind::Draining
        ) {
            return Err(Error::ClassroomExpired(code.as_str().to_string()));
        }
        inner.students.insert(
            connection_id,
            StudentSubscription {
                connection_id,
                target_language,
                joined_at: SystemTime::now(),
                tts_preference,
            },
        );
        inner.ever_had_student = true;
        inner.last_student_left_at = None;
        inner.peak_concurrent_students = inner.peak_concurrent_students.max(inner.students.len());
        inner.touch_activity();
        let teacher_language = inner.teacher_language.clone();
        debug!(session_id = %session.id, connection_id = %connection_id, "student.joined");
        Ok((session.id, teacher_language))
    }

    /// Snapshot of the student subscriptions currently targeting
    /// `target_language`, used by the orchestrator to gate per-recipient
    /// audio delivery by each student's TTS preference (spec §4.6 step 3).
    pub async fn student_subscriptions(
        &self,
        session_id: SessionId,
        target_language: &str,
    ) -> Vec<StudentSubscription> {
        let Some(session) = self.get(session_id) else {
            return Vec::new();
        };
        let inner = session.lock().await;
        inner
            .students
            .values()
            .filter(|s| s.target_language == target_language)
            .cloned()
            .collect()
    }

    /// Update a student's target language (spec §4.5 `language.change`,
    /// "for students, triggers a re-evaluation of which in-flight
    /// translations they should receive" — future finalized utterances
    /// are routed under the new language as soon as this returns).
    pub async fn change_student_language(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        new_language: String,
    ) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut inner = session.lock().await;
        if let Some(sub) = inner.students.get_mut(&connection_id) {
            sub.target_language = new_language;
        }
        inner.touch_activity();
    }

    /// Update the teacher's source language for future utterances.
    pub async fn change_teacher_language(&self, session_id: SessionId, new_language: String) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut inner = session.lock().await;
        inner.teacher_language = new_language;
        inner.touch_activity();
    }

    /// Stamp activity and account for `count` successful translation
    /// deliveries (spec §4.6 step 4, invariant 6).
    pub async fn record_successful_delivery(&self, session_id: SessionId, count: u64) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut inner = session.lock().await;
        inner.total_translations += count;
        inner.touch_activity();
    }

    /// Handle a student connection dropping.
    pub async fn student_disconnected(&self, session_id: SessionId, connection_id: ConnectionId) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut inner = session.lock().await;
        inner.students.remove(&connection_id);
        if inner.students.is_empty() {
            inner.last_student_left_at = Some(SystemTime::now());
        }
        debug!(session_id = %session_id, connection_id = %connection_id, "student.left");
    }

    /// Handle the teacher connection dropping (spec §4.3 state table row
    /// `Active, teacher disconnects, students>0 → Draining`).
    pub async fn teacher_disconnected(&self, session_id: SessionId) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let mut inner = session.lock().await;
        inner.teacher_connection = None;
        if !inner.students.is_empty() {
            inner.state = SessionStateKind::Draining;
            inner.teacher_gone_since = Some(SystemTime::now());
            info!(session_id = %session_id, "session.draining");
        }
    }

    /// Evaluate every session's due timers (spec §4.3 timers, §4.4 step 2)
    /// and transition any that are due into `Expired`. Returns the
    /// `(session_id, reason)` pairs newly transitioned this call. Does
    /// not remove sessions from the registry — that is the sweeper's job
    /// once the terminal record has been flushed.
    pub async fn expire_due_sessions(&self) -> Vec<(SessionId, ExpiryReason)> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut expired = Vec::new();
        let now = SystemTime::now();

        for id in ids {
            let Some(session) = self.get(id) else { continue };
            let mut inner = session.lock().await;
            if inner.state == SessionStateKind::Expired {
                continue;
            }

            if let Some(reason) = self.due_reason(&inner, now) {
                inner.state = SessionStateKind::Expired;
                session.cancellation.cancel();
                warn!(session_id = %id, reason = %reason, "session.expired");
                expired.push((id, reason));
                continue;
            }

            if inner.state == SessionStateKind::Draining {
                if let Some(gone_since) = inner.teacher_gone_since {
                    if now
                        .duration_since(gone_since)
                        .unwrap_or_default()
                        >= self.config.teacher_reconnect_grace
                    {
                        // Grace elapsed without reconnect; spec §4.3's table keeps
                        // the session alive under stale/students-left timers.
                        inner.state = SessionStateKind::Active;
                    }
                }
            }
        }

        expired
    }

    fn due_reason(&self, inner: &SessionInner, now: SystemTime) -> Option<ExpiryReason> {
        if now
            .duration_since(inner.last_activity_at)
            .unwrap_or_default()
            >= self.config.session_stale_timeout
        {
            return Some(ExpiryReason::Stale);
        }
        if !inner.ever_had_student
            && now.duration_since(inner.created_at).unwrap_or_default()
                >= self.config.session_empty_teacher_timeout
        {
            return Some(ExpiryReason::EmptyTeacher);
        }
        if inner.ever_had_student && inner.students.is_empty() {
            if let Some(left_at) = inner.last_student_left_at {
                if now.duration_since(left_at).unwrap_or_default()
                    >= self.config.session_students_left_timeout
                {
                    return Some(ExpiryReason::StudentsLeft);
                }
            }
        }
        None
    }

    /// Remove a (now `Expired`) session from the registry. The caller is
    /// expected to follow up with [`Registry::finalize_removal`] once it
    /// has read the session's final `classroom_code`/`teacher_identity`
    /// (spec §3 "Destroyed by the Cleanup Sweeper").
    pub fn remove_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&session_id).map(|(_, session)| session)
    }

    /// Drop the `by_code` / `by_teacher_identity` index entries and
    /// release the code. Split from [`Registry::remove_session`] so the
    /// sweeper can read the session's final state first.
    pub fn finalize_removal(&self, code: &ClassroomCode, teacher_identity: Option<&str>) {
        self.by_code.remove(code.as_str());
        if let Some(identity) = teacher_identity {
            self.by_teacher_identity.remove(identity);
        }
        self.allocator.release(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_registry() -> Registry {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        Registry::new(allocator, config)
    }

    #[tokio::test]
    async fn teacher_register_creates_a_fresh_session() {
        let registry = test_registry();
        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        assert!(!binding.resumed);
        assert!(registry.get(binding.session_id).is_some());
    }

    #[tokio::test]
    async fn teacher_reconnect_reuses_session_and_code() {
        let registry = test_registry();
        let first = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        let second = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        assert!(second.resumed);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.classroom_code, second.classroom_code);
    }

    #[tokio::test]
    async fn student_register_fails_for_unknown_code() {
        let registry = test_registry();
        let code = ClassroomCode::parse("AB3DK7").unwrap();
        let err = registry
            .register_student(&code, ConnectionId::new(), "es-ES".into(), TtsPreference::Silent)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "classroom_invalid");
    }

    #[tokio::test]
    async fn student_register_succeeds_against_active_session() {
        let registry = test_registry();
        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        let (session_id, teacher_lang) = registry
            .register_student(
                &binding.classroom_code,
                ConnectionId::new(),
                "es-ES".into(),
                TtsPreference::Synthesized,
            )
            .await
            .unwrap();
        assert_eq!(session_id, binding.session_id);
        assert_eq!(teacher_lang, "en-US");
    }

    #[tokio::test]
    async fn teacher_disconnect_with_students_drains_the_session() {
        let registry = test_registry();
        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        registry
            .register_student(
                &binding.classroom_code,
                ConnectionId::new(),
                "es-ES".into(),
                TtsPreference::Silent,
            )
            .await
            .unwrap();
        registry.teacher_disconnected(binding.session_id).await;
        let session = registry.get(binding.session_id).unwrap();
        let inner = session.lock().await;
        assert_eq!(inner.state, SessionStateKind::Draining);
    }

    #[tokio::test]
    async fn empty_teacher_timeout_expires_the_session() {
        let registry = test_registry();
        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let expired = registry.expire_due_sessions().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0], (binding.session_id, ExpiryReason::EmptyTeacher));
    }
}
