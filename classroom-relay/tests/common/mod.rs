//! Shared integration-test harness: wires a registry, orchestrator,
//! fan-out dispatcher, and message router the same way `Coordinator`
//! does, but without a live socket, so scenarios can drive the router
//! directly and inspect outbound envelopes via `ConnectionHandle::recv`.

use std::sync::Arc;

use classroom_relay::code_allocator::CodeAllocator;
use classroom_relay::config::RelayConfig;
use classroom_relay::fanout::FanoutDispatcher;
use classroom_relay::gateway::{ConnectionDirectory, ConnectionHandle};
use classroom_relay::model::ConnectionId;
use classroom_relay::orchestrator::Orchestrator;
use classroom_relay::protocol::{Inbound, Outbound, Role};
use classroom_relay::providers::{EchoTranslator, MemoryRepository, PassthroughStt, ProviderSet, SilentTts};
use classroom_relay::registry::Registry;
use classroom_relay::router::MessageRouter;

pub struct Harness {
    pub registry: Arc<Registry>,
    pub connections: Arc<ConnectionDirectory>,
    pub router: Arc<MessageRouter>,
    pub repo: Arc<MemoryRepository>,
    pub config: Arc<RelayConfig>,
}

impl Harness {
    pub fn new() -> Self {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config.clone()));
        let connections = Arc::new(ConnectionDirectory::new(config.send_queue_depth));
        let fanout = Arc::new(FanoutDispatcher::new(registry.clone(), connections.clone()));
        let repo = Arc::new(MemoryRepository::new());
        let providers = ProviderSet {
            stt: Arc::new(PassthroughStt),
            translator: Arc::new(EchoTranslator),
            tts: Arc::new(SilentTts),
            repository: repo.clone(),
        };
        let orchestrator = Orchestrator::new(registry.clone(), providers.clone(), fanout, config.clone());
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            orchestrator,
            providers,
            connections.clone(),
            config.clone(),
        ));
        Self {
            registry,
            connections,
            router,
            repo,
            config,
        }
    }

    /// Register a fresh connection handle (no role/session yet).
    pub fn new_connection(&self) -> (ConnectionId, Arc<ConnectionHandle>) {
        let id = ConnectionId::new();
        let handle = self.connections.register(id);
        (id, handle)
    }

    /// Register a teacher connection and return its handle plus the
    /// `classroomCode` assigned in the resulting `connection` envelope.
    pub async fn register_teacher(&self, identity: &str, language: &str) -> (Arc<ConnectionHandle>, String) {
        let (_, handle) = self.new_connection();
        self.router
            .handle(
                &handle,
                Inbound::Register {
                    role: Role::Teacher,
                    language_code: language.to_string(),
                    token: Some(identity.to_string()),
                    classroom_code: None,
                },
            )
            .await;
        let code = match handle.recv().await {
            Outbound::Connection { classroom_code, .. } => classroom_code.expect("teacher gets a code"),
            other => panic!("expected connection envelope, got {other:?}"),
        };
        let _ack = handle.recv().await; // register ack
        (handle, code)
    }

    /// Register a student connection against `code`, targeting `language`.
    pub async fn register_student(&self, code: &str, language: &str) -> Arc<ConnectionHandle> {
        let (_, handle) = self.new_connection();
        self.router
            .handle(
                &handle,
                Inbound::Register {
                    role: Role::Student,
                    language_code: language.to_string(),
                    token: None,
                    classroom_code: Some(code.to_string()),
                },
            )
            .await;
        let _connection = handle.recv().await;
        let _ack = handle.recv().await;
        handle
    }

    pub async fn send_final_transcription(&self, teacher: &Arc<ConnectionHandle>, text: &str) {
        self.router
            .handle(
                teacher,
                Inbound::Transcription {
                    text: text.to_string(),
                    is_final: true,
                    timestamp: None,
                    lang: None,
                },
            )
            .await;
    }
}
