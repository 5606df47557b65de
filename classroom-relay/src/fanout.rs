//! Fan-out Dispatcher (spec §4.7): delivers a ready translation payload
//! to every student connection subscribed to a target language.

use std::sync::Arc;

use tracing::debug;

use crate::gateway::ConnectionDirectory;
use crate::model::{ConnectionId, SessionId};
use crate::protocol::Outbound;
use crate::registry::Registry;

/// Fans translated envelopes out to subscribed student connections.
pub struct FanoutDispatcher {
    registry: Arc<Registry>,
    connections: Arc<ConnectionDirectory>,
}

impl FanoutDispatcher {
    pub fn new(registry: Arc<Registry>, connections: Arc<ConnectionDirectory>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Deliver the same envelope to every student currently subscribed
    /// to `target_language` in `session_id` (spec §4.7). Delivery is
    /// best-effort per connection; a blocked or closed connection is
    /// skipped without affecting others.
    ///
    /// Returns the connection ids actually enqueued, so the orchestrator
    /// can stamp activity only when at least one delivery succeeded.
    pub async fn fanout_same(
        &self,
        session_id: SessionId,
        target_language: &str,
        envelope: Outbound,
    ) -> Vec<ConnectionId> {
        let Some(session) = self.registry.get(session_id) else {
            return Vec::new();
        };
        let subscribers = {
            let inner = session.lock().await;
            inner.subscribers_for(target_language)
        };
        let deliveries = subscribers
            .into_iter()
            .map(|connection_id| (connection_id, envelope.clone()))
            .collect();
        self.deliver(deliveries).await
    }

    /// Deliver a distinct, already-built envelope to each listed
    /// connection (used when delivery varies per-recipient, e.g. audio
    /// gated by an individual student's TTS preference).
    pub async fn deliver(&self, deliveries: Vec<(ConnectionId, Outbound)>) -> Vec<ConnectionId> {
        let mut delivered = Vec::with_capacity(deliveries.len());
        for (connection_id, envelope) in deliveries {
            if self.connections.send_to(connection_id, envelope) {
                delivered.push(connection_id);
            } else {
                debug!(%connection_id, "fanout: connection gone, skipped");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_allocator::CodeAllocator;
    use crate::config::RelayConfig;
    use crate::model::{ConnectionId, TtsPreference};

    #[tokio::test]
    async fn fanout_skips_connections_with_no_live_handle() {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config));
        let connections = Arc::new(ConnectionDirectory::new(16));

        let binding = registry
            .register_teacher("teacher-1".into(), "en-US".into(), ConnectionId::new())
            .await
            .unwrap();
        let student_conn = ConnectionId::new();
        registry
            .register_student(
                &binding.classroom_code,
                student_conn,
                "es-ES".into(),
                TtsPreference::Silent,
            )
            .await
            .unwrap();

        let dispatcher = FanoutDispatcher::new(registry.clone(), connections);
        let delivered = dispatcher
            .fanout_same(binding.session_id, "es-ES", Outbound::Pong)
            .await;
        // No live connection handle registered for student_conn: delivery is a no-op.
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn deliver_reports_only_successful_recipients() {
        let config = Arc::new(RelayConfig::test_defaults());
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config));
        let connections = Arc::new(ConnectionDirectory::new(16));
        let dispatcher = FanoutDispatcher::new(registry, connections);

        let missing = ConnectionId::new();
        let delivered = dispatcher
            .deliver(vec![(missing, Outbound::Pong)])
            .await;
        assert!(delivered.is_empty());
    }
}
