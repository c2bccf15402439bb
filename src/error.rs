//! Error handling for the chat server

use std::fmt;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Network-related errors (socket reads/writes, accept failures)
    Network(String),
    /// Authentication errors
    Auth(String),
    /// Protocol errors (malformed or unexpected client input)
    Protocol(String),
    /// Room not found
    RoomNotFound(String),
    /// Room name collision on create
    RoomExists(String),
    /// User-store persistence errors
    Storage(String),
    /// Upstream text-generation service errors
    Upstream(String),
    /// Configuration error
    Config(String),
    /// Server internal error
    Internal(String),
}

impl ChatError {
    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create an authentication error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        ChatError::Auth(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a room-not-found error
    pub fn room_not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::RoomNotFound(msg.into())
    }

    /// Create a room-collision error
    pub fn room_exists<T: Into<String>>(msg: T) -> Self {
        ChatError::RoomExists(msg.into())
    }

    /// Create a storage error
    pub fn storage<T: Into<String>>(msg: T) -> Self {
        ChatError::Storage(msg.into())
    }

    /// Create an upstream error
    pub fn upstream<T: Into<String>>(msg: T) -> Self {
        ChatError::Upstream(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Network(msg) => write!(f, "Network error: {}", msg),
            ChatError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ChatError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ChatError::RoomNotFound(msg) => write!(f, "Room not found: {}", msg),
            ChatError::RoomExists(msg) => write!(f, "Room already exists: {}", msg),
            ChatError::Storage(msg) => write!(f, "Storage error: {}", msg),
            ChatError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            ChatError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Upstream(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Upstream(format!("HTTP error: {}", err))
    }
}

impl From<rustls::Error> for ChatError {
    fn from(err: rustls::Error) -> Self {
        ChatError::Config(format!("TLS error: {}", err))
    }
}
