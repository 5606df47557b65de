//! Explicit wiring for one running relay instance (spec §9 Design
//! Notes: "no module-level singletons" — every collaborator is an
//! owned value reachable from this struct).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tracing::info;

use crate::admin::admin_router;
use crate::code_allocator::CodeAllocator;
use crate::config::RelayConfig;
use crate::gateway::{ConnectionDirectory, Gateway, GatewayExpiryNotifier};
use crate::orchestrator::Orchestrator;
use crate::fanout::FanoutDispatcher;
use crate::providers::ProviderSet;
use crate::registry::Registry;
use crate::router::MessageRouter;
use crate::sweeper::Sweeper;

/// Owns every long-lived collaborator for one relay instance: the code
/// allocator, session registry, translation orchestrator, connection
/// gateway, and cleanup sweeper.
pub struct Coordinator {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
    pub connections: Arc<ConnectionDirectory>,
    pub gateway: Arc<Gateway>,
    pub sweeper: Arc<Sweeper>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Coordinator {
    /// Assemble a coordinator from a configuration and a provider set.
    /// Construction performs no I/O; nothing starts running until
    /// [`Coordinator::run`] is called.
    pub fn new(config: RelayConfig, providers: ProviderSet) -> Self {
        let config = Arc::new(config);
        let allocator = Arc::new(CodeAllocator::new(config.classroom_code_ttl));
        let registry = Arc::new(Registry::new(allocator, config.clone()));
        let connections = Arc::new(ConnectionDirectory::new(config.send_queue_depth));

        let fanout = Arc::new(FanoutDispatcher::new(registry.clone(), connections.clone()));
        let orchestrator = Orchestrator::new(registry.clone(), providers.clone(), fanout, config.clone());

        let message_router = Arc::new(MessageRouter::new(
            registry.clone(),
            orchestrator.clone(),
            providers.clone(),
            connections.clone(),
            config.clone(),
        ));
        let gateway = Arc::new(Gateway::new(
            config.clone(),
            connections.clone(),
            message_router,
            registry.clone(),
        ));

        let notifier = Arc::new(GatewayExpiryNotifier::new(connections.clone()));
        let sweeper = Arc::new(Sweeper::new(
            registry.clone(),
            providers.repository.clone(),
            notifier,
            config.session_cleanup_interval,
        ));

        Self {
            config,
            registry,
            connections,
            gateway,
            sweeper,
            orchestrator,
        }
    }

    /// Build the administrative HTTP router wired to this instance's
    /// registry and sweeper (spec §6.3).
    pub fn admin_router(&self) -> axum::Router {
        admin_router(self.registry.clone(), self.sweeper.clone(), self.config.clone())
    }

    /// Run the gateway accept loop and sweeper loop concurrently until
    /// `shutdown` fires. Each collaborator gets its own shutdown signal
    /// flavor because the gateway broadcasts to (potentially) several
    /// listeners while the sweeper only ever has one.
    pub async fn run(
        self: Arc<Self>,
        bind_addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let (sweeper_tx, sweeper_rx) = oneshot::channel();
        let sweeper = self.sweeper.clone();
        let sweeper_task = tokio::spawn(async move {
            sweeper.run(sweeper_rx).await;
        });

        let gateway_shutdown = shutdown.resubscribe();
        let gateway = self.gateway.clone();
        let gateway_task = tokio::spawn(async move { gateway.serve(bind_addr, gateway_shutdown).await });

        let _ = shutdown.recv().await;
        info!("coordinator: shutdown requested");
        let _ = sweeper_tx.send(());

        let _ = sweeper_task.await;
        match gateway_task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(%err, "coordinator: gateway task panicked");
                Ok(())
            }
        }
    }
}
