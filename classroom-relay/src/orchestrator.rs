//! Translation Pipeline Orchestrator (spec §4.6): for each finalized
//! utterance, invokes translate + TTS per subscribed target language,
//! enforcing at-most-one-in-flight per `(session, utterance, lang)` and
//! in-order delivery per `(session, lang)`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::RelayConfig;
use crate::fanout::FanoutDispatcher;
use crate::model::{SessionId, SessionStateKind, TtsPreference, Utterance, UtteranceId};
use crate::protocol::{LatencyComponents, Outbound};
use crate::providers::{ProviderSet, TranscriptRecord, TranslationRecord};
use crate::registry::{Registry, Session};

/// Key identifying one per-language delivery lane within a session.
type LangKey = (SessionId, String);
/// Key identifying one translation job (spec §4.6 step 2).
type JobKey = (SessionId, UtteranceId, String);

/// Coordinates translation/TTS fan-out for finalized utterances.
pub struct Orchestrator {
    registry: Arc<Registry>,
    providers: ProviderSet,
    fanout: Arc<FanoutDispatcher>,
    config: Arc<RelayConfig>,
    seen_jobs: DashMap<JobKey, ()>,
    lang_queues: DashMap<LangKey, mpsc::UnboundedSender<Utterance>>,
    /// Translation jobs submitted but not yet finished processing, across
    /// every session/language lane (spec §5 "ceilings on... outstanding
    /// translation jobs").
    in_flight_jobs: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        providers: ProviderSet,
        fanout: Arc<FanoutDispatcher>,
        config: Arc<RelayConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            providers,
            fanout,
            config,
            seen_jobs: DashMap::new(),
            lang_queues: DashMap::new(),
            in_flight_jobs: AtomicUsize::new(0),
        })
    }

    /// Entry point for a finalized transcription/audio utterance (spec
    /// §4.6 contract, steps 1-2). The source transcript is persisted
    /// unconditionally, even if no student is currently subscribed.
    pub async fn submit_utterance(self: &Arc<Self>, session_id: SessionId, utterance: Utterance) {
        if let Err(err) = self
            .providers
            .repository
            .insert_transcript(TranscriptRecord {
                session_id,
                utterance_id: utterance.utterance_id,
                source_text: utterance.source_text.clone(),
                source_lang: utterance.source_lang.clone(),
            })
            .await
        {
            warn!(%session_id, %err, "orchestrator: failed to persist transcript");
        }

        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let target_languages = {
            let inner = session.lock().await;
            inner.distinct_target_languages()
        };
        if target_languages.is_empty() {
            return;
        }

        for target_language in target_languages {
            let key: JobKey = (session_id, utterance.utterance_id, target_language.clone());
            if self.seen_jobs.insert(key, ()).is_some() {
                // A concurrent duplicate request with this exact key already
                // has (or had) a job in flight; spec §4.6 step 2 says reuse it.
                continue;
            }
            if self.in_flight_jobs.fetch_add(1, Ordering::SeqCst) >= self.config.max_translation_jobs {
                self.in_flight_jobs.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    %session_id,
                    %target_language,
                    "orchestrator: max_translation_jobs ceiling reached, dropping job"
                );
                continue;
            }
            let sender = self.lang_queue(session_id, target_language);
            let _ = sender.send(utterance.clone());
        }
    }

    fn lang_queue(
        self: &Arc<Self>,
        session_id: SessionId,
        target_language: String,
    ) -> mpsc::UnboundedSender<Utterance> {
        let key: LangKey = (session_id, target_language.clone());
        if let Some(tx) = self.lang_queues.get(&key) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.lang_queues.insert(key, tx.clone());
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_lang_worker(session_id, target_language, rx).await;
        });
        tx
    }

    /// Per-(session, targetLanguage) serial worker: processes utterances
    /// strictly in the order they were submitted, giving the in-order
    /// delivery guarantee from spec §4.6 ("Ordering guarantee").
    async fn run_lang_worker(
        self: Arc<Self>,
        session_id: SessionId,
        target_language: String,
        mut jobs: mpsc::UnboundedReceiver<Utterance>,
    ) {
        while let Some(utterance) = jobs.recv().await {
            self.process_one(session_id, &target_language, utterance).await;
            self.in_flight_jobs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Whether `target_language` still has a live subscriber in a non-expired
    /// session (spec §4.6 "Cancellation"), re-checked after every await point
    /// in [`Orchestrator::process_one`] since either condition can change
    /// mid-flight.
    async fn still_subscribed(&self, session: &Arc<Session>, target_language: &str) -> bool {
        let inner = session.lock().await;
        inner.state != SessionStateKind::Expired && !inner.subscribers_for(target_language).is_empty()
    }

    async fn process_one(&self, session_id: SessionId, target_language: &str, utterance: Utterance) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let cancel = session.cancellation();

        let teacher_language = {
            let inner = session.lock().await;
            if inner.state == SessionStateKind::Expired {
                return; // spec §4.6 Cancellation: session expired before delivery.
            }
            if inner.subscribers_for(target_language).is_empty() {
                return; // spec §4.6 Cancellation: last subscriber disconnected.
            }
            inner.teacher_language.clone()
        };

        let deadline = self.config.translation_deadline;
        let start = SystemTime::now();
        let translated_text = self
            .translate_with_retry(
                &utterance.source_text,
                &teacher_language,
                target_language,
                deadline,
                &cancel,
            )
            .await;
        let translation_ms = start
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if cancel.is_cancelled() || !self.still_subscribed(&session, target_language).await {
            return; // spec §4.6 Cancellation: stop before acting on a stale result.
        }

        let Some(translated_text) = translated_text else {
            let _ = self
                .providers
                .repository
                .insert_translation(TranslationRecord {
                    session_id,
                    utterance_id: utterance.utterance_id,
                    target_language: target_language.to_string(),
                    translated_text: None,
                    latency_ms: translation_ms,
                })
                .await;
            self.fanout
                .fanout_same(
                    session_id,
                    target_language,
                    Outbound::Error {
                        code: "translation_failed",
                        message: format!("translation to {target_language} failed"),
                        retry_after: None,
                    },
                )
                .await;
            return;
        };

        let tts_start = SystemTime::now();
        let tts_result = tokio::select! {
            result = self.providers.tts.synthesize(&translated_text, target_language, None, self.config.tts_deadline, &cancel) => result.ok(),
            _ = cancel.cancelled() => None,
        };
        let tts_ms = tts_start.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0);

        if cancel.is_cancelled() || !self.still_subscribed(&session, target_language).await {
            return; // spec §4.6 Cancellation: stop before delivering a stale result.
        }

        let latency = LatencyComponents {
            translation_ms,
            tts_ms,
            total_ms: translation_ms + tts_ms,
        };
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let deliveries = {
            let subs = self.registry.student_subscriptions(session_id, target_language).await;
            subs.into_iter()
                .map(|sub| {
                    let (audio, audio_format) = match (&tts_result, sub.tts_preference) {
                        (Some(audio), TtsPreference::Synthesized) => {
                            use base64::Engine;
                            (
                                Some(base64::engine::general_purpose::STANDARD.encode(&audio.bytes)),
                                Some(audio.format.clone()),
                            )
                        }
                        _ => (None, None),
                    };
                    let envelope = Outbound::Translation {
                        session_id,
                        source_language: teacher_language.clone(),
                        target_language: target_language.to_string(),
                        original_text: utterance.source_text.clone(),
                        translated_text: translated_text.clone(),
                        audio,
                        audio_format,
                        timestamp,
                        latency: latency.clone(),
                        tts_service_type: if tts_result.is_some() { "synthesized" } else { "none" },
                        use_client_speech: matches!(sub.tts_preference, TtsPreference::BrowserNative),
                    };
                    (sub.connection_id, envelope)
                })
                .collect::<Vec<_>>()
        };

        let delivered = self.fanout.deliver(deliveries).await;

        if let Err(err) = self
            .providers
            .repository
            .insert_translation(TranslationRecord {
                session_id,
                utterance_id: utterance.utterance_id,
                target_language: target_language.to_string(),
                translated_text: Some(translated_text),
                latency_ms: latency.total_ms,
            })
            .await
        {
            error!(%session_id, %err, "orchestrator: failed to persist translation row");
        }

        if !delivered.is_empty() {
            self.registry
                .record_successful_delivery(session_id, delivered.len() as u64)
                .await;
        }
    }

    /// Retry policy for the translation provider: up to 3 attempts with
    /// exponential backoff (spec §4.6 "Failure semantics"). Races every
    /// attempt and backoff sleep against `cancel` so a session that expires
    /// mid-retry doesn't run the remaining attempts to completion.
    async fn translate_with_retry(
        &self,
        text: &str,
        from: &str,
        to: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                result = self.providers.translator.translate(text, from, to, deadline, cancel) => result,
                _ = cancel.cancelled() => return None,
            };
            match outcome {
                Ok(translated) => return Some(translated),
                Err(err) if attempt < 3 => {
                    warn!(%err, attempt, "orchestrator: translation attempt failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))) => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
                Err(err) => {
                    error!(%err, attempt, "orchestrator: translation failed, giving up");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_allocator::CodeAllocator;
    use crate::gateway::ConnectionDirectory;
    use crate::model::{ConnectionId, UtteranceId};
    use crate::providers::{EchoTranslator, MemoryRepository, PassthroughStt, SilentTts};

    fn test_setup() -> (Arc<Registry>, Arc<Orchestrator>, Arc<MemoryRepository>) {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config.clone()));
        let connections = Arc::new(ConnectionDirectory::new(config.send_queue_depth));
        let fanout = Arc::new(FanoutDispatcher::new(registry.clone(), connections));
        let repo = Arc::new(MemoryRepository::new());
        let providers = ProviderSet {
            stt: Arc::new(PassthroughStt),
            translator: Arc::new(EchoTranslator),
            tts: Arc::new(SilentTts),
            repository: repo.clone(),
        };
        let orchestrator = Orchestrator::new(registry.clone(), providers, fanout, config);
        (registry, orchestrator, repo)
    }

    #[tokio::test]
    async fn submit_with_no_subscribers_still_persists_transcript() {
        let (registry, orchestrator, repo) = test_setup();
        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        let utterance = Utterance {
            utterance_id: UtteranceId::new(),
            session_id: binding.session_id,
            source_text: "Hello class".into(),
            source_lang: "en-US".into(),
            created_at: SystemTime::now(),
        };
        orchestrator
            .submit_utterance(binding.session_id, utterance)
            .await;
        assert_eq!(repo.transcript_count(), 1);
        assert_eq!(repo.translation_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_utterance_only_queues_one_job_per_language() {
        let (registry, orchestrator, repo) = test_setup();
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
        let utterance = Utterance {
            utterance_id: UtteranceId::new(),
            session_id: binding.session_id,
            source_text: "Hello class".into(),
            source_lang: "en-US".into(),
            created_at: SystemTime::now(),
        };
        orchestrator
            .submit_utterance(binding.session_id, utterance.clone())
            .await;
        orchestrator
            .submit_utterance(binding.session_id, utterance)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(repo.translation_count(), 1);
    }
}
