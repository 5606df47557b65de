//! Runtime configuration for the classroom relay (spec §6.4).

use std::time::Duration;

use crate::error::{Error, Result};

/// All recognized configuration options, with the "prod" defaults from
/// spec §6.4. Every timer is a [`Duration`] so call sites never need to
/// remember which unit a raw integer was in.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Classroom code lifetime (`classroomCodeTTL`).
    pub classroom_code_ttl: Duration,
    /// `T_stale`: expire a session after this much inactivity.
    pub session_stale_timeout: Duration,
    /// `T_emptyTeacher`: expire a session no student ever joined within this long.
    pub session_empty_teacher_timeout: Duration,
    /// `T_studentsLeft`: expire a session this long after the last student leaves.
    pub session_students_left_timeout: Duration,
    /// `T_sweep`: cleanup sweeper tick interval.
    pub session_cleanup_interval: Duration,
    /// `T_teacherGone`: teacher reconnect grace window.
    pub teacher_reconnect_grace: Duration,
    /// Maximum simultaneous connections accepted by the gateway.
    pub max_connections: usize,
    /// Maximum simultaneous sessions held by the registry.
    pub max_sessions: usize,
    /// Maximum translation jobs in flight across all sessions.
    pub max_translation_jobs: usize,
    /// Per-connection bounded send queue depth.
    pub send_queue_depth: usize,
    /// Enable the student-to-teacher two-way ask channel.
    pub two_way_enabled: bool,
    /// Enable the `e2e=true` auth-bypass query parameter. Must never be
    /// set in a production configuration (spec §9 Design Notes).
    pub e2e_bypass_enabled: bool,
    /// Deadline for a single translation provider call.
    pub translation_deadline: Duration,
    /// Deadline for a single TTS provider call.
    pub tts_deadline: Duration,
    /// Deadline for a single STT chunk.
    pub stt_deadline: Duration,
    /// Idle ping interval for gateway connections.
    pub ping_interval: Duration,
    /// Pong grace period before a connection is closed as idle.
    pub pong_timeout: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            classroom_code_ttl: Duration::from_secs(2 * 60 * 60),
            session_stale_timeout: Duration::from_secs(90 * 60),
            session_empty_teacher_timeout: Duration::from_secs(10 * 60),
            session_students_left_timeout: Duration::from_secs(10 * 60),
            session_cleanup_interval: Duration::from_secs(2 * 60),
            teacher_reconnect_grace: Duration::from_secs(30),
            max_connections: 5_000,
            max_sessions: 500,
            max_translation_jobs: 2_000,
            send_queue_depth: 64,
            two_way_enabled: false,
            e2e_bypass_enabled: false,
            translation_deadline: Duration::from_secs(5),
            tts_deadline: Duration::from_secs(4),
            stt_deadline: Duration::from_secs(2),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Test-environment defaults: every timer collapses to a few seconds
    /// so integration tests (spec §8 S1-S6) don't need to sleep for
    /// real-world durations. `twoWay` is enabled, matching spec §6.4's
    /// test-environment column.
    pub fn test_defaults() -> Self {
        Self {
            classroom_code_ttl: Duration::from_secs(10),
            session_stale_timeout: Duration::from_secs(5),
            session_empty_teacher_timeout: Duration::from_secs(2),
            session_students_left_timeout: Duration::from_secs(2),
            session_cleanup_interval: Duration::from_millis(200),
            teacher_reconnect_grace: Duration::from_secs(1),
            max_connections: 100,
            max_sessions: 50,
            max_translation_jobs: 100,
            send_queue_depth: 16,
            two_way_enabled: true,
            e2e_bypass_enabled: true,
            translation_deadline: Duration::from_millis(500),
            tts_deadline: Duration::from_millis(500),
            stt_deadline: Duration::from_millis(500),
            ping_interval: Duration::from_secs(2),
            pong_timeout: Duration::from_secs(1),
            max_frame_bytes: 1024 * 1024,
        }
    }

    /// Overlay environment variables onto [`RelayConfig::default`].
    ///
    /// Unset variables fall back to the struct default, mirroring
    /// `HTTP_BIND_ADDRESS`-style env overrides used by the sibling
    /// service binaries this crate was adapted from.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("RELAY_CLASSROOM_CODE_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                config.classroom_code_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_SESSION_STALE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.session_stale_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_SESSION_EMPTY_TEACHER_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.session_empty_teacher_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_SESSION_STUDENTS_LEFT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.session_students_left_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_SESSION_CLEANUP_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                config.session_cleanup_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_TEACHER_RECONNECT_GRACE_SECS") {
            if let Ok(secs) = v.parse() {
                config.teacher_reconnect_grace = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("RELAY_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                config.max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("RELAY_MAX_SESSIONS") {
            if let Ok(n) = v.parse() {
                config.max_sessions = n;
            }
        }
        if let Ok(v) = std::env::var("RELAY_SEND_QUEUE_DEPTH") {
            if let Ok(n) = v.parse() {
                config.send_queue_depth = n;
            }
        }
        if let Ok(v) = std::env::var("RELAY_FEATURE_TWO_WAY") {
            config.two_way_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("RELAY_E2E_BYPASS") {
            config.e2e_bypass_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Validate cross-field and range invariants not expressible in the type.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be > 0".into()));
        }
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("max_sessions must be > 0".into()));
        }
        if self.send_queue_depth == 0 {
            return Err(Error::InvalidConfig("send_queue_depth must be > 0".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::InvalidConfig("max_frame_bytes must be > 0".into()));
        }
        if self.teacher_reconnect_grace >= self.session_stale_timeout {
            return Err(Error::InvalidConfig(
                "teacher_reconnect_grace must be shorter than session_stale_timeout".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_prod_column() {
        let config = RelayConfig::default();
        assert_eq!(config.classroom_code_ttl, Duration::from_secs(7200));
        assert_eq!(config.session_stale_timeout, Duration::from_secs(5400));
        assert_eq!(config.teacher_reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.max_connections, 5_000);
        assert_eq!(config.max_sessions, 500);
        assert!(!config.two_way_enabled);
        assert!(!config.e2e_bypass_enabled);
    }

    #[test]
    fn default_config_validates() {
        assert!(RelayConfig::default().validate().is_ok());
        assert!(RelayConfig::test_defaults().validate().is_ok());
    }

    #[test]
    fn rejects_zero_ceilings() {
        let mut config = RelayConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_grace_not_shorter_than_stale_timeout() {
        let mut config = RelayConfig::test_defaults();
        config.teacher_reconnect_grace = config.session_stale_timeout;
        assert!(config.validate().is_err());
    }
}
