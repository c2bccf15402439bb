//! Parlor - Multi-Room TLS Chat Server
//!
//! A line-oriented chat service with durable session identity and an
//! optional per-room AI participant backed by an external
//! text-generation endpoint.
//!
//! ## Architecture
//!
//! - **Listener** (`ChatServer`): accepts TLS (or diagnostic plaintext)
//!   connections and spawns one handler task per socket.
//! - **ConnectionHandler**: per-connection state machine
//!   (pre-auth → lobby ↔ in-room), heartbeats, reconnect restoration.
//! - **Room** fan-out: broadcasts commit to bounded history under the
//!   room lock, then fan out to per-subscriber bounded queues with
//!   drop-on-dead-transport semantics.
//! - **SessionRegistry**: opaque-token sessions with absolute TTL that
//!   survive transport loss, enabling `RECONNECT` with room restoration.
//! - **AiCompleter**: prompt assembly from recent history, fingerprint
//!   cache with TTL, and a simplified-request fallback path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use parlor::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = ChatServer::new(ServerConfig::from_env())?;
//!     server.bind().await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod ai;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

// Re-export error types
pub use error::{ChatError, Result};

// Re-export configuration
pub use config::ServerConfig;

// Re-export protocol types
pub use protocol::{Command, ParseError, Reply};

// Re-export server types
pub use server::{
    ChatServer, ConnectionHandler, DeliverySink, MessageQueue, Room, RoomRegistry, Session,
    SessionRegistry, User, UserStore,
};

// Re-export the AI pipeline
pub use ai::AiCompleter;
