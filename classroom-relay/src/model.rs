//! Core data model (spec §3): sessions, classroom codes, utterances,
//! and student subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, server-generated session identifier. Stable across teacher
/// reconnects (spec §3 `sessionId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Mint a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection identifier, assigned by the Connection Gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Mint a new random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single finalized utterance, used to deduplicate
/// translation fan-out and correlate provider results (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtteranceId(pub Uuid);

impl UtteranceId {
    /// Mint a new random utterance id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UtteranceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unambiguous six-character classroom-code alphabet (spec §6.1):
/// `A-Z` minus `O,I`, plus digits `2-9`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A six-character classroom code. Always stored/compared uppercase;
/// input is case-insensitive (spec §6.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassroomCode(String);

impl ClassroomCode {
    /// Validate and normalize a client-supplied code to uppercase.
    pub fn parse(raw: &str) -> Result<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.len() != 6 || !upper.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
            return Err(Error::ClassroomInvalid(raw.to_string()));
        }
        Ok(Self(upper))
    }

    /// Build directly from bytes already known to be valid (allocator use).
    pub(crate) fn from_valid(raw: String) -> Self {
        debug_assert_eq!(raw.len(), 6);
        Self(raw)
    }

    /// The uppercase six-character string as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassroomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a student wants synthesized speech delivered (spec §3
/// `StudentSubscription.ttsPreference`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsPreference {
    /// Server should synthesize audio and deliver it inline.
    Synthesized,
    /// No audio wanted, text only.
    Silent,
    /// Client will use its own browser speech synthesis.
    BrowserNative,
}

impl Default for TtsPreference {
    fn default() -> Self {
        TtsPreference::Synthesized
    }
}

/// One connected student's subscription to a session (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSubscription {
    /// Student's connection id.
    pub connection_id: ConnectionId,
    /// Target language the student wants translations in.
    pub target_language: String,
    /// When this student joined the session.
    pub joined_at: SystemTime,
    /// Speech-synthesis delivery preference.
    pub tts_preference: TtsPreference,
}

/// Session lifecycle state (spec §3 `state`, §4.3 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateKind {
    /// Teacher connected (or within reconnect grace), serving students.
    Active,
    /// Teacher connection dropped with students present; within grace window.
    Draining,
    /// Terminal state, awaiting the cleanup sweeper.
    Expired,
}

/// Reason a session expired, echoed in the `session.expired` envelope
/// (spec §6.1) and the terminal storage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// `T_stale` fired: no activity for too long.
    Stale,
    /// `T_emptyTeacher` fired: no student ever joined.
    EmptyTeacher,
    /// `T_studentsLeft` fired: all students left and didn't return.
    StudentsLeft,
    /// Forced by an administrative cleanup call.
    Admin,
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExpiryReason::Stale => "stale",
            ExpiryReason::EmptyTeacher => "empty_teacher",
            ExpiryReason::StudentsLeft => "students_left",
            ExpiryReason::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

/// The mutable state of one session, owned exclusively by that
/// session's controller task per the locking discipline in spec §5.
#[derive(Debug)]
pub struct SessionInner {
    /// Stable identifier of the owning teacher. Nullable only transiently
    /// during a reconnect window (spec §3 invariant).
    pub teacher_identity: Option<String>,
    /// Current classroom code. May rotate across the session's lifetime
    /// only by virtue of being a *new* session after expiry.
    pub classroom_code: ClassroomCode,
    /// Teacher's source language (BCP-47-ish tag, e.g. `en-US`).
    pub teacher_language: String,
    /// The teacher's current connection, if attached.
    pub teacher_connection: Option<ConnectionId>,
    /// Connected students, keyed by connection id.
    pub students: HashMap<ConnectionId, StudentSubscription>,
    /// Lifecycle state.
    pub state: SessionStateKind,
    pub created_at: SystemTime,
    pub last_activity_at: SystemTime,
    pub teacher_connected_at: Option<SystemTime>,
    pub last_student_left_at: Option<SystemTime>,
    /// Set when the teacher disconnects while students are present;
    /// cleared on reconnect. Drives `T_teacherGone`.
    pub teacher_gone_since: Option<SystemTime>,
    pub total_translations: u64,
    pub peak_concurrent_students: usize,
    /// True once at least one student has ever joined; distinguishes
    /// "students present then left" from "nobody ever joined" for the
    /// empty-teacher vs. students-left timers.
    pub ever_had_student: bool,
}

impl SessionInner {
    /// Construct a freshly created, `Active` session for a just-connected
    /// teacher (spec §4.3 "Created when...").
    pub fn new(classroom_code: ClassroomCode, teacher_identity: String, teacher_language: String, teacher_connection: ConnectionId) -> Self {
        let now = SystemTime::now();
        Self {
            teacher_identity: Some(teacher_identity),
            classroom_code,
            teacher_language,
            teacher_connection: Some(teacher_connection),
            students: HashMap::new(),
            state: SessionStateKind::Active,
            created_at: now,
            last_activity_at: now,
            teacher_connected_at: Some(now),
            last_student_left_at: None,
            teacher_gone_since: None,
            total_translations: 0,
            peak_concurrent_students: 0,
            ever_had_student: false,
        }
    }

    /// Stamp `lastActivityAt = now` (spec §4.3: every activity event does
    /// this). Monotonically non-decreasing per invariant 3.
    pub fn touch_activity(&mut self) {
        let now = SystemTime::now();
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Distinct target languages currently subscribed (spec §4.6 step 1).
    pub fn distinct_target_languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self
            .students
            .values()
            .map(|s| s.target_language.clone())
            .collect();
        langs.sort();
        langs.dedup();
        langs
    }

    /// Student connection ids currently subscribed to a given language.
    pub fn subscribers_for(&self, language: &str) -> Vec<ConnectionId> {
        self.students
            .values()
            .filter(|s| s.target_language == language)
            .map(|s| s.connection_id)
            .collect()
    }
}

/// A transient record of one finalized piece of teacher speech or text
/// (spec §3 `Utterance`). The unit of translation fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub utterance_id: UtteranceId,
    pub session_id: SessionId,
    pub source_text: String,
    pub source_lang: String,
    pub created_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classroom_code_rejects_ambiguous_characters() {
        assert!(ClassroomCode::parse("ABC01I").is_err());
        assert!(ClassroomCode::parse("ABCDEO").is_err());
    }

    #[test]
    fn classroom_code_normalizes_case() {
        let code = ClassroomCode::parse("ab3dk7").unwrap();
        assert_eq!(code.as_str(), "AB3DK7");
    }

    #[test]
    fn classroom_code_rejects_wrong_length() {
        assert!(ClassroomCode::parse("ABCDE").is_err());
        assert!(ClassroomCode::parse("ABCDEFG").is_err());
    }

    #[test]
    fn distinct_target_languages_deduplicates_and_sorts() {
        let mut inner = SessionInner::new(
            ClassroomCode::parse("AB3DK7").unwrap(),
            "teacher-1".into(),
            "en-US".into(),
            ConnectionId::new(),
        );
        for lang in ["es-ES", "de-DE", "es-ES"] {
            let conn = ConnectionId::new();
            inner.students.insert(
                conn,
                StudentSubscription {
                    connection_id: conn,
                    target_language: lang.into(),
                    joined_at: SystemTime::now(),
                    tts_preference: TtsPreference::Silent,
                },
            );
        }
        assert_eq!(
            inner.distinct_target_languages(),
            vec!["de-DE".to_string(), "es-ES".to_string()]
        );
    }

    #[test]
    fn touch_activity_is_monotonic() {
        let mut inner = SessionInner::new(
            ClassroomCode::parse("AB3DK7").unwrap(),
            "teacher-1".into(),
            "en-US".into(),
            ConnectionId::new(),
        );
        let first = inner.last_activity_at;
        inner.touch_activity();
        assert!(inner.last_activity_at >= first);
    }
}
