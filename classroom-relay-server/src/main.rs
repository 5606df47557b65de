//! Classroom Translation Relay server binary entry point.
//!
//! Starts the client-facing WebSocket gateway and the administrative
//! HTTP surface as two listeners sharing one `Coordinator`.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:8080 gateway, 0.0.0.0:8081 admin)
//! cargo run -p classroom-relay-server
//!
//! # With logging
//! RUST_LOG=debug cargo run -p classroom-relay-server
//! ```
//!
//! # Environment Variables
//!
//! See [`classroom_relay::RelayConfig::from_env`] for the full list of
//! `RELAY_*` overrides. Bind addresses are controlled separately by
//! `--bind`/`--admin-bind` or `RELAY_BIND`/`RELAY_ADMIN_BIND`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use classroom_relay::providers::ProviderSet;
use classroom_relay::{Coordinator, RelayConfig};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Classroom Translation Relay
///
/// Real-time session and connection coordinator for a live-translation
/// classroom: teacher speech is transcribed, translated per student
/// target language, and fanned back out over WebSocket.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Client-facing WebSocket gateway bind address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "RELAY_BIND")]
    bind: SocketAddr,

    /// Administrative HTTP surface bind address (spec §6.3).
    #[arg(long, default_value = "0.0.0.0:8081", env = "RELAY_ADMIN_BIND")]
    admin_bind: SocketAddr,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            info!("second interrupt received, forcing immediate exit");
            std::process::exit(0);
        }
        info!("interrupt received, shutting down");
    })
    .expect("failed to install Ctrl+C handler");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("classroom-relay")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = RelayConfig::from_env();
    config.validate().map_err(|err| {
        error!(%err, "invalid configuration, refusing to start");
        err
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        admin_bind = %args.admin_bind,
        "classroom-relay server starting"
    );

    let coordinator = Arc::new(Coordinator::new(config, ProviderSet::stub()));

    let (shutdown_tx, _) = broadcast::channel(1);
    let watcher_tx = shutdown_tx.clone();
    let watcher = tokio::spawn(async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let _ = watcher_tx.send(());
    });

    let admin_listener = tokio::net::TcpListener::bind(args.admin_bind).await?;
    let admin_router = coordinator.admin_router();
    let mut admin_shutdown = shutdown_tx.subscribe();
    let admin_task = tokio::spawn(async move {
        let server = axum::serve(admin_listener, admin_router).with_graceful_shutdown(async move {
            let _ = admin_shutdown.recv().await;
        });
        if let Err(err) = server.await {
            error!(%err, "admin HTTP server exited with error");
        }
    });

    let relay_shutdown = shutdown_tx.subscribe();
    coordinator.run(args.bind, relay_shutdown).await?;

    let _ = admin_task.await;
    let _ = watcher.await;

    info!("classroom-relay server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
