//! Wire envelopes exchanged with client connections (spec §6.1).
//!
//! Mirrors the tagged-enum-over-JSON shape used throughout this
//! codebase's signaling layer: one `type` discriminant, one params
//! struct per variant, `rename_all = "camelCase"` for field names to
//! match the browser client's JSON.

use serde::{Deserialize, Serialize};

use crate::model::{ConnectionId, SessionId};

/// A client role, set at `register` time (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
}

/// Envelopes accepted from client connections (spec §6.1 inbound table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Bind a connection to a role.
    Register {
        role: Role,
        #[serde(rename = "languageCode")]
        language_code: String,
        /// Teacher only: already-validated identity token. The core
        /// treats this as opaque (spec §1: auth is an external collaborator).
        #[serde(default)]
        token: Option<String>,
        /// Student only: the code printed on the teacher UI.
        #[serde(rename = "classroomCode", default)]
        classroom_code: Option<String>,
    },
    /// A piece of transcribed text, possibly interim (spec §4.5).
    Transcription {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        timestamp: Option<i64>,
        #[serde(default)]
        lang: Option<String>,
    },
    /// One chunk of a streamed audio utterance (spec §4.5).
    Audio {
        data: String,
        #[serde(rename = "isFirstChunk")]
        is_first_chunk: bool,
        #[serde(rename = "isFinalChunk")]
        is_final_chunk: bool,
        language: String,
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        manual: bool,
    },
    /// Change this connection's language (teacher source or student target).
    #[serde(rename = "language.change")]
    LanguageChange {
        #[serde(rename = "languageCode")]
        language_code: String,
    },
    /// Client-initiated keepalive.
    Ping,
    /// Two-way ask channel (`featureFlags.twoWay`), push-to-talk form.
    #[serde(rename = "student.ptt")]
    StudentPtt { text: String },
    /// Two-way ask channel, direct send form.
    #[serde(rename = "student.send")]
    StudentSend { text: String },
}

/// Non-recoverable-per-utterance failure reasons surfaced in `translation`
/// outbound envelopes and the `error` envelope (spec §6.1, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredReasonWire {
    Stale,
    EmptyTeacher,
    StudentsLeft,
    Admin,
}

impl From<crate::model::ExpiryReason> for ExpiredReasonWire {
    fn from(reason: crate::model::ExpiryReason) -> Self {
        match reason {
            crate::model::ExpiryReason::Stale => ExpiredReasonWire::Stale,
            crate::model::ExpiryReason::EmptyTeacher => ExpiredReasonWire::EmptyTeacher,
            crate::model::ExpiryReason::StudentsLeft => ExpiredReasonWire::StudentsLeft,
            crate::model::ExpiryReason::Admin => ExpiredReasonWire::Admin,
        }
    }
}

/// Latency breakdown attached to `translation`/`processing_complete`
/// envelopes (spec §6.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyComponents {
    #[serde(rename = "translationMs")]
    pub translation_ms: u64,
    #[serde(rename = "ttsMs")]
    pub tts_ms: u64,
    #[serde(rename = "totalMs")]
    pub total_ms: u64,
}

/// Envelopes sent to client connections (spec §6.1 outbound table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Sent immediately after a successful `register` (control, never dropped).
    Connection {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        role: Role,
        #[serde(rename = "languageCode")]
        language_code: String,
        #[serde(rename = "classroomCode")]
        classroom_code: Option<String>,
    },
    /// Acknowledges a `register` request.
    Register {
        status: &'static str,
        data: RegisterAck,
    },
    /// An STT/translation pass has finished for one utterance.
    ProcessingComplete {
        #[serde(rename = "utteranceId")]
        utterance_id: String,
        #[serde(rename = "targetLanguages")]
        target_languages: Vec<String>,
        latency: LatencyComponents,
    },
    /// One translated delivery for one subscriber (spec §4.6 step 4).
    Translation {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "sourceLanguage")]
        source_language: String,
        #[serde(rename = "targetLanguage")]
        target_language: String,
        #[serde(rename = "originalText")]
        original_text: String,
        #[serde(rename = "translatedText")]
        translated_text: String,
        audio: Option<String>,
        #[serde(rename = "audioFormat")]
        audio_format: Option<String>,
        timestamp: i64,
        latency: LatencyComponents,
        #[serde(rename = "ttsServiceType")]
        tts_service_type: &'static str,
        #[serde(rename = "useClientSpeech")]
        use_client_speech: bool,
    },
    /// The owning session transitioned to `Expired` (control, never dropped).
    SessionExpired { reason: ExpiredReasonWire },
    /// A recoverable or connection-closing error (control, never dropped).
    Error {
        code: &'static str,
        message: String,
        #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    /// Reply to a client `ping` (control, never dropped).
    Pong,
    /// Two-way ask channel delivery to the teacher connection.
    StudentQuestion {
        #[serde(rename = "fromConnectionId")]
        from_connection_id: ConnectionId,
        text: String,
    },
}

/// Payload of a `register` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub role: Role,
    #[serde(rename = "languageCode")]
    pub language_code: String,
}

/// Message delivery class (spec §4.1 send-queue backpressure policy).
/// Control frames are exempt from drop-oldest-non-critical eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Control,
    UserVisible,
    Informational,
}

impl Outbound {
    /// Classify this envelope for the gateway's send-queue eviction policy.
    pub fn class(&self) -> MessageClass {
        match self {
            Outbound::Connection { .. }
            | Outbound::Register { .. }
            | Outbound::SessionExpired { .. }
            | Outbound::Error { .. }
            | Outbound::Pong => MessageClass::Control,
            Outbound::Translation { .. } | Outbound::StudentQuestion { .. } => {
                MessageClass::UserVisible
            }
            Outbound::ProcessingComplete { .. } => MessageClass::Informational,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_envelope_round_trips_through_json() {
        let raw = r#"{"type":"register","role":"student","languageCode":"es-ES","classroomCode":"ab3dk7"}"#;
        let msg: Inbound = serde_json::from_str(raw).unwrap();
        match msg {
            Inbound::Register {
                role,
                language_code,
                classroom_code,
                ..
            } => {
                assert_eq!(role, Role::Student);
                assert_eq!(language_code, "es-ES");
                assert_eq!(classroom_code.as_deref(), Some("ab3dk7"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let raw = r#"{"type":"not_a_real_type"}"#;
        assert!(serde_json::from_str::<Inbound>(raw).is_err());
    }

    #[test]
    fn control_frames_are_never_droppable() {
        let env = Outbound::Pong;
        assert_eq!(env.class(), MessageClass::Control);
        let env = Outbound::Error {
            code: "capacity",
            message: "server at capacity".into(),
            retry_after: None,
        };
        assert_eq!(env.class(), MessageClass::Control);
    }

    #[test]
    fn translation_envelope_serializes_camel_case_fields() {
        let env = Outbound::Translation {
            session_id: SessionId::new(),
            source_language: "en-US".into(),
            target_language: "es-ES".into(),
            original_text: "Hello".into(),
            translated_text: "Hola".into(),
            audio: None,
            audio_format: None,
            timestamp: 0,
            latency: LatencyComponents::default(),
            tts_service_type: "none",
            use_client_speech: false,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"targetLanguage\":\"es-ES\""));
        assert!(json.contains("\"originalText\":\"Hello\""));
    }
}
