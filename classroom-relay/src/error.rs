//! Error types for the classroom relay core.

use uuid::Uuid;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the session/connection coordinator.
///
/// Each variant maps to a stable wire error code (spec §7) via
/// [`Error::error_code`], used both in outbound `error` envelopes and in
/// structured logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Teacher identity missing or not yet validated by the caller.
    #[error("authentication required")]
    AuthRequired,

    /// Teacher identity present but rejected.
    #[error("invalid authentication: {0}")]
    AuthInvalid(String),

    /// Classroom code does not resolve to any session.
    #[error("classroom code not found: {0}")]
    ClassroomInvalid(String),

    /// Classroom code resolved, but the session is no longer active.
    #[error("classroom code expired: {0}")]
    ClassroomExpired(String),

    /// Operation attempted from the wrong role (teacher vs. student).
    #[error("operation forbidden for this role: {0}")]
    RoleForbidden(String),

    /// Inbound frame exceeded the maximum payload size.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Inbound frame could not be decoded as a known envelope.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Inbound envelope named an unrecognized `type`.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Translation provider failed after exhausting its retry policy.
    #[error("translation failed: {0}")]
    TranslationFailed(String),

    /// TTS provider failed (never retried beyond one attempt).
    #[error("tts failed: {0}")]
    TtsFailed(String),

    /// STT provider failed to produce a transcription.
    #[error("stt failed: {0}")]
    SttFailed(String),

    /// A configured resource ceiling (connections/sessions/jobs) was hit.
    #[error("server at capacity")]
    Capacity,

    /// Connection closed because no pong was received in time.
    #[error("idle timeout")]
    IdleTimeout,

    /// Connection closed because its session expired.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Requested session, code, or job was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration value out of the documented range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for conditions that should not occur in normal operation.
    /// Always carries a correlation id so operators can grep logs for it.
    #[error("internal error ({correlation_id}): {message}")]
    Internal {
        /// Correlation id included in both the log line and the wire error.
        correlation_id: Uuid,
        /// Human-readable detail.
        message: String,
    },

    /// Transport-level I/O failure (socket, frame codec).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Construct an [`Error::Internal`] with a fresh correlation id.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            correlation_id: Uuid::new_v4(),
            message: message.into(),
        }
    }

    /// Stable string code sent on the wire in `error.code` (spec §7).
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::AuthRequired => "auth_required",
            Error::AuthInvalid(_) => "auth_invalid",
            Error::ClassroomInvalid(_) => "classroom_invalid",
            Error::ClassroomExpired(_) => "classroom_expired",
            Error::RoleForbidden(_) => "role_forbidden",
            Error::PayloadTooLarge => "payload_too_large",
            Error::InvalidFrame(_) => "invalid_frame",
            Error::UnknownType(_) => "unknown_type",
            Error::TranslationFailed(_) => "translation_failed",
            Error::TtsFailed(_) => "tts_failed",
            Error::SttFailed(_) => "stt_failed",
            Error::Capacity => "capacity",
            Error::IdleTimeout => "idle_timeout",
            Error::SessionExpired(_) => "session_expired",
            Error::NotFound(_) => "not_found",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal { .. } => "internal",
            Error::Io(_) => "internal",
            Error::Json(_) => "invalid_frame",
        }
    }

    /// Whether a caller should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TranslationFailed(_) | Error::SttFailed(_) | Error::Io(_)
        )
    }

    /// Whether this error should close the originating connection
    /// (spec §7 "Surfacing"), as opposed to being reported non-fatally.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Error::AuthRequired
                | Error::AuthInvalid(_)
                | Error::ClassroomInvalid(_)
                | Error::ClassroomExpired(_)
                | Error::PayloadTooLarge
                | Error::InvalidFrame(_)
                | Error::Capacity
                | Error::IdleTimeout
                | Error::SessionExpired(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_stable_strings() {
        assert_eq!(Error::AuthRequired.error_code(), "auth_required");
        assert_eq!(
            Error::ClassroomExpired("ABCD23".into()).error_code(),
            "classroom_expired"
        );
    }

    #[test]
    fn transient_provider_errors_are_retryable() {
        assert!(Error::TranslationFailed("timeout".into()).is_retryable());
        assert!(!Error::TtsFailed("timeout".into()).is_retryable());
        assert!(!Error::InvalidConfig("bad".into()).is_retryable());
    }

    #[test]
    fn protocol_violations_close_the_connection() {
        assert!(Error::PayloadTooLarge.closes_connection());
        assert!(Error::Capacity.closes_connection());
        assert!(!Error::TranslationFailed("x".into()).closes_connection());
    }

    #[test]
    fn internal_error_carries_a_correlation_id() {
        let err = Error::internal("unexpected state");
        match err {
            Error::Internal { correlation_id, .. } => assert!(!correlation_id.is_nil()),
            _ => panic!("expected Internal variant"),
        }
    }
}
