//! Session and connection coordinator for a real-time classroom
//! translation relay: tracks teacher/student WebSocket connections,
//! allocates classroom codes, and orchestrates speech-to-text,
//! translation, and text-to-speech fan-out for each finalized
//! utterance.

pub mod admin;
pub mod code_allocator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod router;
pub mod sweeper;

pub use config::RelayConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
