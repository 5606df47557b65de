//! Pluggable provider interfaces (spec §6.2): speech recognition,
//! translation, speech synthesis, and durable storage. The core only
//! ever depends on these traits; concrete engines are injected by
//! whoever embeds this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{ExpiryReason, SessionId, UtteranceId};

/// One incoming chunk of teacher audio (spec §4.5 `audio` envelope).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub is_first_chunk: bool,
    pub is_final_chunk: bool,
}

/// One transcription event produced by an STT provider (spec §6.2).
#[derive(Debug, Clone)]
pub struct TranscriptionEvent {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// Speech-to-text engine (spec §6.2 `STT`). Implementations must be
/// safe to invoke concurrently across unrelated sessions.
#[async_trait]
pub trait Stt: Send + Sync {
    /// Feed one audio chunk for `source_lang`; return any transcription
    /// events it produced. `cancel` is honored on a best-effort basis.
    async fn transcribe_chunk(
        &self,
        chunk: AudioChunk,
        source_lang: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptionEvent>>;
}

/// Pure, stateless text translation engine (spec §6.2 `Translator`).
/// `cancel` is honored on a best-effort basis, the same as [`Stt`].
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        from: &str,
        to: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Synthesized speech produced by a [`Tts`] provider.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: String,
}

/// Text-to-speech engine (spec §6.2 `TTS`). `cancel` is honored on a
/// best-effort basis, the same as [`Stt`].
#[async_trait]
pub trait Tts: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        lang: &str,
        voice_hints: Option<&str>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio>;
}

/// One persisted translation result (spec §6.2 `InsertTranslation`).
#[derive(Debug, Clone)]
pub struct TranslationRecord {
    pub session_id: SessionId,
    pub utterance_id: UtteranceId,
    pub target_language: String,
    pub translated_text: Option<String>,
    pub latency_ms: u64,
}

/// One persisted transcript row (spec §6.2 `InsertTranscript`).
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    pub session_id: SessionId,
    pub utterance_id: UtteranceId,
    pub source_text: String,
    pub source_lang: String,
}

/// Snapshot written at session creation/update time (spec §6.2 `UpsertSession`).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub classroom_code: String,
    pub teacher_identity: String,
    pub teacher_language: String,
}

/// Terminal record written once by the sweeper (spec §6.2 `EndSession`,
/// spec §9 "sweeper is the sole writer of terminal session records").
#[derive(Debug, Clone)]
pub struct SessionEndRecord {
    pub session_id: SessionId,
    pub reason: ExpiryReason,
    pub total_translations: u64,
    pub peak_concurrent_students: usize,
}

/// Narrow persistence boundary for analytics/audit storage (spec §6.2
/// `Repository`). All operations are idempotent on the keys documented
/// per method.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Idempotent on `sessionId`.
    async fn upsert_session(&self, record: SessionRecord) -> Result<()>;
    /// Idempotent on `sessionId`.
    async fn end_session(&self, record: SessionEndRecord) -> Result<()>;
    /// Idempotent on `(sessionId, utteranceId, targetLanguage)`.
    async fn insert_translation(&self, record: TranslationRecord) -> Result<()>;
    /// Idempotent on `(sessionId, utteranceId)`.
    async fn insert_transcript(&self, record: TranscriptRecord) -> Result<()>;
    /// Diagnostic snapshot of currently-active sessions.
    async fn fetch_active_sessions(&self) -> Result<Vec<SessionId>>;
    /// Administrative forced cleanup hook, independent of the sweeper's
    /// own schedule.
    async fn admin_force_cleanup(&self) -> Result<()>;
}

/// A [`Repository`] that logs and drops everything. Suitable when no
/// durable storage is wired up (e.g. a local demo run).
#[derive(Debug, Default)]
pub struct NullRepository;

#[async_trait]
impl Repository for NullRepository {
    async fn upsert_session(&self, record: SessionRecord) -> Result<()> {
        tracing::debug!(session_id = %record.session_id, "null repository: upsert_session");
        Ok(())
    }

    async fn end_session(&self, record: SessionEndRecord) -> Result<()> {
        tracing::debug!(session_id = %record.session_id, reason = %record.reason, "null repository: end_session");
        Ok(())
    }

    async fn insert_translation(&self, record: TranslationRecord) -> Result<()> {
        tracing::debug!(session_id = %record.session_id, lang = %record.target_language, "null repository: insert_translation");
        Ok(())
    }

    async fn insert_transcript(&self, record: TranscriptRecord) -> Result<()> {
        tracing::debug!(session_id = %record.session_id, "null repository: insert_transcript");
        Ok(())
    }

    async fn fetch_active_sessions(&self) -> Result<Vec<SessionId>> {
        Ok(Vec::new())
    }

    async fn admin_force_cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory [`Repository`] backed by a mutex-guarded `Vec`, used by
/// integration tests to assert row counts (spec §8 S1-S6).
#[derive(Debug, Default)]
pub struct MemoryRepository {
    sessions: Mutex<Vec<SessionRecord>>,
    ends: Mutex<Vec<SessionEndRecord>>,
    translations: Mutex<Vec<TranslationRecord>>,
    transcripts: Mutex<Vec<TranscriptRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translation_count(&self) -> usize {
        self.translations.lock().len()
    }

    pub fn transcript_count(&self) -> usize {
        self.transcripts.lock().len()
    }

    pub fn translations_for(&self, session_id: SessionId) -> Vec<TranslationRecord> {
        self.translations
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn end_records(&self) -> Vec<SessionEndRecord> {
        self.ends.lock().clone()
    }
}

impl Clone for SessionRecord {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            classroom_code: self.classroom_code.clone(),
            teacher_identity: self.teacher_identity.clone(),
            teacher_language: self.teacher_language.clone(),
        }
    }
}

impl Clone for SessionEndRecord {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            reason: self.reason,
            total_translations: self.total_translations,
            peak_concurrent_students: self.peak_concurrent_students,
        }
    }
}

impl Clone for TranslationRecord {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            utterance_id: self.utterance_id,
            target_language: self.target_language.clone(),
            translated_text: self.translated_text.clone(),
            latency_ms: self.latency_ms,
        }
    }
}

impl Clone for TranscriptRecord {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            utterance_id: self.utterance_id,
            source_text: self.source_text.clone(),
            source_lang: self.source_lang.clone(),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_session(&self, record: SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.iter_mut().find(|s| s.session_id == record.session_id) {
            *existing = record;
        } else {
            sessions.push(record);
        }
        Ok(())
    }

    async fn end_session(&self, record: SessionEndRecord) -> Result<()> {
        self.ends.lock().push(record);
        Ok(())
    }

    async fn insert_translation(&self, record: TranslationRecord) -> Result<()> {
        self.translations.lock().push(record);
        Ok(())
    }

    async fn insert_transcript(&self, record: TranscriptRecord) -> Result<()> {
        self.transcripts.lock().push(record);
        Ok(())
    }

    async fn fetch_active_sessions(&self) -> Result<Vec<SessionId>> {
        Ok(self.sessions.lock().iter().map(|s| s.session_id).collect())
    }

    async fn admin_force_cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`Translator`] that deterministically tags the target language
/// rather than calling a real engine (spec §9's note: legacy mock
/// fixtures are test scaffolding, never inferred runtime behavior —
/// this stub is explicitly labeled, not a silent Spanish default).
#[derive(Debug, Default)]
pub struct EchoTranslator;

#[async_trait]
impl Translator for EchoTranslator {
    async fn translate(
        &self,
        text: &str,
        _from: &str,
        to: &str,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        Ok(format!("[{to}] {text}"))
    }
}

/// A [`Tts`] provider that never produces audio, matching the
/// `useClientSpeech`/browser-native delivery path (spec §3
/// `StudentSubscription.ttsPreference`).
#[derive(Debug, Default)]
pub struct SilentTts;

#[async_trait]
impl Tts for SilentTts {
    async fn synthesize(
        &self,
        _text: &str,
        _lang: &str,
        _voice_hints: Option<&str>,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> Result<SynthesizedAudio> {
        Ok(SynthesizedAudio {
            bytes: Vec::new(),
            format: "none".into(),
        })
    }
}

/// An [`Stt`] stub that treats every chunk marked final as a completed
/// transcription of a fixed placeholder, useful for exercising the
/// audio ingestion path without a real recognition engine.
#[derive(Debug, Default)]
pub struct PassthroughStt;

#[async_trait]
impl Stt for PassthroughStt {
    async fn transcribe_chunk(
        &self,
        chunk: AudioChunk,
        _source_lang: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<TranscriptionEvent>> {
        if chunk.is_final_chunk {
            Ok(vec![TranscriptionEvent {
                text: String::new(),
                is_final: true,
                confidence: None,
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Type-erased provider handles shared across sessions (spec §9's
/// `Coordinator` value owns one of each, rather than reaching for a
/// module-level singleton).
#[derive(Clone)]
pub struct ProviderSet {
    pub stt: Arc<dyn Stt>,
    pub translator: Arc<dyn Translator>,
    pub tts: Arc<dyn Tts>,
    pub repository: Arc<dyn Repository>,
}

impl ProviderSet {
    /// A fully stubbed provider set suitable for local runs and tests.
    pub fn stub() -> Self {
        Self {
            stt: Arc::new(PassthroughStt),
            translator: Arc::new(EchoTranslator),
            tts: Arc::new(SilentTts),
            repository: Arc::new(MemoryRepository::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_translator_tags_target_language() {
        let translator = EchoTranslator;
        let out = translator
            .translate(
                "Hello class",
                "en-US",
                "es-ES",
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "[es-ES] Hello class");
    }

    #[tokio::test]
    async fn silent_tts_never_produces_audio() {
        let tts = SilentTts;
        let out = tts
            .synthesize(
                "hola",
                "es-ES",
                None,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.bytes.is_empty());
    }

    #[tokio::test]
    async fn memory_repository_tracks_inserted_rows() {
        let repo = MemoryRepository::new();
        let session_id = SessionId::new();
        repo.insert_translation(TranslationRecord {
            session_id,
            utterance_id: UtteranceId::new(),
            target_language: "es-ES".into(),
            translated_text: Some("Hola".into()),
            latency_ms: 10,
        })
        .await
        .unwrap();
        assert_eq!(repo.translation_count(), 1);
        assert_eq!(repo.translations_for(session_id).len(), 1);
    }
}
