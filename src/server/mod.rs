//! Server-side subsystems
//!
//! Listener → connection handler → room fan-out, plus the registries
//! (users, sessions, rooms) they share.

pub mod chat_server;
pub mod connection_handler;
pub mod room;
pub mod room_registry;
pub mod session;
pub mod user_store;

pub use chat_server::ChatServer;
pub use connection_handler::{ConnectionHandler, Transport};
pub use room::{DeliverySink, MessageQueue, Room};
pub use room_registry::RoomRegistry;
pub use session::{Session, SessionRegistry};
pub use user_store::{User, UserStore};
