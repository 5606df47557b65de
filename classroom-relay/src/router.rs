//! Message Router (spec §4.5): dispatches inbound envelopes to handlers,
//! enforcing role and session preconditions before acting.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::config::RelayConfig;
use crate::error::Error;
use crate::gateway::{ConnectionDirectory, ConnectionHandle};
use crate::model::{ClassroomCode, SessionStateKind, TtsPreference, Utterance, UtteranceId};
use crate::orchestrator::Orchestrator;
use crate::protocol::{Inbound, Outbound, RegisterAck, Role};
use crate::providers::{AudioChunk, ProviderSet};
use crate::registry::Registry;

/// Routes decoded inbound envelopes to the appropriate handler.
pub struct MessageRouter {
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    providers: ProviderSet,
    connections: Arc<ConnectionDirectory>,
    config: Arc<RelayConfig>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        providers: ProviderSet,
        connections: Arc<ConnectionDirectory>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            providers,
            connections,
            config,
        }
    }

    /// Handle one decoded inbound envelope for `conn` (spec §4.5).
    pub async fn handle(&self, conn: &Arc<ConnectionHandle>, message: Inbound) {
        match message {
            Inbound::Register {
                role,
                language_code,
                token,
                classroom_code,
            } => self.handle_register(conn, role, language_code, token, classroom_code).await,
            Inbound::Transcription {
                text,
                is_final,
                lang,
                ..
            } => self.handle_transcription(conn, text, is_final, lang).await,
            Inbound::Audio {
                data,
                is_first_chunk,
                is_final_chunk,
                language,
                manual,
                ..
            } => {
                self.handle_audio(conn, data, is_first_chunk, is_final_chunk, language, manual)
                    .await
            }
            Inbound::LanguageChange { language_code } => {
                self.handle_language_change(conn, language_code).await
            }
            Inbound::Ping => conn.send(Outbound::Pong),
            Inbound::StudentPtt { text } | Inbound::StudentSend { text } => {
                self.handle_student_ask(conn, text).await
            }
        }
    }

    async fn handle_register(
        &self,
        conn: &Arc<ConnectionHandle>,
        role: Role,
        language_code: String,
        token: Option<String>,
        classroom_code: Option<String>,
    ) {
        match role {
            Role::Teacher => {
                let identity = match token.filter(|t| !t.is_empty()) {
                    Some(t) => t,
                    None if self.config.e2e_bypass_enabled => format!("e2e-{}", conn.id),
                    None => {
                        self.fail_register(conn, Error::AuthRequired);
                        return;
                    }
                };
                match self
                    .registry
                    .register_teacher(identity, language_code.clone(), conn.id)
                    .await
                {
                    Ok(binding) => {
                        *conn.role.lock() = Some(Role::Teacher);
                        *conn.session_id.lock() = Some(binding.session_id);
                        *conn.language.lock() = language_code.clone();
                        conn.send(Outbound::Connection {
                            session_id: binding.session_id,
                            role: Role::Teacher,
                            language_code: language_code.clone(),
                            classroom_code: Some(binding.classroom_code.as_str().to_string()),
                        });
                        conn.send(Outbound::Register {
                            status: "ok",
                            data: RegisterAck {
                                role: Role::Teacher,
                                language_code,
                            },
                        });
                    }
                    Err(err) => self.fail_register(conn, err),
                }
            }
            Role::Student => {
                let Some(raw_code) = classroom_code else {
                    self.fail_register(conn, Error::ClassroomInvalid("missing".into()));
                    return;
                };
                let code = match ClassroomCode::parse(&raw_code) {
                    Ok(code) => code,
                    Err(err) => {
                        self.fail_register(conn, err);
                        return;
                    }
                };
                match self
                    .registry
                    .register_student(&code, conn.id, language_code.clone(), TtsPreference::Synthesized)
                    .await
                {
                    Ok((session_id, _teacher_language)) => {
                        *conn.role.lock() = Some(Role::Student);
                        *conn.session_id.lock() = Some(session_id);
                        *conn.language.lock() = language_code.clone();
                        conn.send(Outbound::Connection {
                            session_id,
                            role: Role::Student,
                            language_code: language_code.clone(),
                            classroom_code: None,
                        });
                        conn.send(Outbound::Register {
                            status: "ok",
                            data: RegisterAck {
                                role: Role::Student,
                                language_code,
                            },
                        });
                    }
                    Err(err) => self.fail_register(conn, err),
                }
            }
        }
    }

    fn fail_register(&self, conn: &Arc<ConnectionHandle>, err: Error) {
        conn.send(Outbound::Error {
            code: err.error_code(),
            message: err.to_string(),
            retry_after: None,
        });
        conn.request_close();
    }

    async fn handle_transcription(
        &self,
        conn: &Arc<ConnectionHandle>,
        text: String,
        is_final: bool,
        lang: Option<String>,
    ) {
        let Some((session_id, source_lang)) = self.teacher_context(conn, lang).await else {
            return;
        };
        if !is_final {
            // Interim (non-final) transcriptions update a per-session
            // preview buffer in richer deployments; this core only acts
            // on finalized utterances (spec §4.5).
            debug!(%session_id, "router: interim transcription received");
            return;
        }
        self.finalize_utterance(session_id, text, source_lang).await;
    }

    async fn handle_audio(
        &self,
        conn: &Arc<ConnectionHandle>,
        data: String,
        is_first_chunk: bool,
        is_final_chunk: bool,
        language: String,
        manual: bool,
    ) {
        let Some((session_id, _)) = self.teacher_context(conn, Some(language.clone())).await else {
            return;
        };
        let Some(session) = self.registry.get(session_id) else {
            return;
        };

        let bytes = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &data) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail_register(conn, Error::InvalidFrame(err.to_string()));
                return;
            }
        };

        // `manual=true` marks a teacher-reviewed segment: treat as final
        // on receipt without speculative STT processing (spec §4.5).
        if manual {
            let text = String::from_utf8_lossy(&bytes).to_string();
            self.finalize_utterance(session_id, text, language).await;
            return;
        }

        let cancel = session.cancellation();
        let chunk = AudioChunk {
            data: bytes,
            is_first_chunk,
            is_final_chunk,
        };
        match self.providers.stt.transcribe_chunk(chunk, &language, &cancel).await {
            Ok(events) => {
                for event in events {
                    if event.is_final {
                        self.finalize_utterance(session_id, event.text, language.clone()).await;
                    }
                }
            }
            Err(err) => {
                conn.send(Outbound::Error {
                    code: err.error_code(),
                    message: err.to_string(),
                    retry_after: None,
                });
            }
        }
    }

    async fn finalize_utterance(&self, session_id: crate::model::SessionId, text: String, source_lang: String) {
        let utterance = Utterance {
            utterance_id: UtteranceId::new(),
            session_id,
            source_text: text,
            source_lang,
            created_at: SystemTime::now(),
        };
        self.orchestrator.submit_utterance(session_id, utterance).await;
    }

    /// Validate that `conn` is a registered teacher of an `Active`
    /// session, returning `(sessionId, currentSourceLanguage)` on success.
    async fn teacher_context(
        &self,
        conn: &Arc<ConnectionHandle>,
        override_lang: Option<String>,
    ) -> Option<(crate::model::SessionId, String)> {
        let role = *conn.role.lock();
        if role != Some(Role::Teacher) {
            conn.send(Outbound::Error {
                code: Error::RoleForbidden("teacher-only operation".into()).error_code(),
                message: "teacher-only operation".into(),
                retry_after: None,
            });
            return None;
        }
        let session_id = (*conn.session_id.lock())?;
        let session = self.registry.get(session_id)?;
        let inner = session.lock().await;
        if inner.state != SessionStateKind::Active {
            conn.send(Outbound::Error {
                code: Error::SessionExpired(session_id.to_string()).error_code(),
                message: "session is not active".into(),
                retry_after: None,
            });
            return None;
        }
        let lang = override_lang.unwrap_or_else(|| inner.teacher_language.clone());
        Some((session_id, lang))
    }

    async fn handle_language_change(&self, conn: &Arc<ConnectionHandle>, language_code: String) {
        let role = *conn.role.lock();
        let Some(session_id) = *conn.session_id.lock() else {
            return;
        };
        *conn.language.lock() = language_code.clone();
        match role {
            Some(Role::Teacher) => {
                self.registry.change_teacher_language(session_id, language_code).await
            }
            Some(Role::Student) => {
                self.registry
                    .change_student_language(session_id, conn.id, language_code)
                    .await
            }
            None => {}
        }
    }

    async fn handle_student_ask(&self, conn: &Arc<ConnectionHandle>, text: String) {
        if !self.config.two_way_enabled {
            conn.send(Outbound::Error {
                code: Error::UnknownType("student.ptt".into()).error_code(),
                message: "two-way ask channel is disabled".into(),
                retry_after: None,
            });
            return;
        }
        if *conn.role.lock() != Some(Role::Student) {
            conn.send(Outbound::Error {
                code: Error::RoleForbidden("student-only operation".into()).error_code(),
                message: "student-only operation".into(),
                retry_after: None,
            });
            return;
        }
        let Some(session_id) = *conn.session_id.lock() else {
            return;
        };
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let teacher_connection = {
            let inner = session.lock().await;
            inner.teacher_connection
        };
        if let Some(teacher_id) = teacher_connection {
            self.connections.send_to(
                teacher_id,
                Outbound::StudentQuestion {
                    from_connection_id: conn.id,
                    text,
                },
            );
        }
    }
}
