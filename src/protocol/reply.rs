//! Server replies
//!
//! `Display` renders the exact wire text; the connection handler appends
//! the newline terminator when writing.

use std::fmt;

/// A server-to-client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    AuthRequired,
    AuthSuccess { username: String, token: String },
    AuthFailed,
    RegisterSuccess,
    RegisterFailed { reason: String },
    ReconnectSuccess { username: String, room: Option<String> },
    SessionExpired,
    RoomList { names: Vec<String> },
    JoinedRoom { name: String },
    LeftRoom,
    RoomCreated { name: String },
    AiRoomCreated { name: String },
    RoomMessage { payload: String },
    Error { reason: String },
    LoggedOut,
    Heartbeat,
    HeartbeatAck,
    InvalidFormat,
    InvalidFormatAiRoom,
    UnknownCommand,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::AuthRequired => write!(f, "AUTH_REQUIRED"),
            Reply::AuthSuccess { username, token } => {
                write!(f, "AUTH_SUCCESS {} {}", username, token)
            }
            Reply::AuthFailed => write!(f, "AUTH_FAILED"),
            Reply::RegisterSuccess => write!(f, "REGISTER_SUCCESS"),
            Reply::RegisterFailed { reason } => write!(f, "REGISTER_FAILED {}", reason),
            Reply::ReconnectSuccess { username, room } => match room {
                Some(room) => write!(f, "RECONNECT_SUCCESS {} {}", username, room),
                None => write!(f, "RECONNECT_SUCCESS {}", username),
            },
            Reply::SessionExpired => write!(f, "SESSION_EXPIRED"),
            Reply::RoomList { names } => write!(f, "ROOM_LIST {}", names.join(",")),
            Reply::JoinedRoom { name } => write!(f, "JOINED_ROOM {}", name),
            Reply::LeftRoom => write!(f, "LEFT_ROOM"),
            Reply::RoomCreated { name } => write!(f, "ROOM_CREATED {}", name),
            Reply::AiRoomCreated { name } => write!(f, "AI_ROOM_CREATED {}", name),
            Reply::RoomMessage { payload } => write!(f, "ROOM_MESSAGE {}", payload),
            Reply::Error { reason } => write!(f, "ERROR {}", reason),
            Reply::LoggedOut => write!(f, "LOGGED_OUT"),
            Reply::Heartbeat => write!(f, "HEARTBEAT"),
            Reply::HeartbeatAck => write!(f, "HEARTBEAT_ACK"),
            Reply::InvalidFormat => write!(f, "INVALID_FORMAT"),
            Reply::InvalidFormatAiRoom => write!(f, "INVALID_FORMAT_AI_ROOM"),
            Reply::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
        }
    }
}

impl Reply {
    /// Error reply with a human-readable reason
    pub fn error<T: Into<String>>(reason: T) -> Self {
        Reply::Error {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_text() {
        assert_eq!(Reply::AuthRequired.to_string(), "AUTH_REQUIRED");
        assert_eq!(
            Reply::AuthSuccess {
                username: "alice".to_string(),
                token: "t1".to_string(),
            }
            .to_string(),
            "AUTH_SUCCESS alice t1"
        );
        assert_eq!(
            Reply::ReconnectSuccess {
                username: "alice".to_string(),
                room: Some("lobby".to_string()),
            }
            .to_string(),
            "RECONNECT_SUCCESS alice lobby"
        );
        assert_eq!(
            Reply::ReconnectSuccess {
                username: "alice".to_string(),
                room: None,
            }
            .to_string(),
            "RECONNECT_SUCCESS alice"
        );
        assert_eq!(
            Reply::RoomList {
                names: vec!["General".to_string(), "Library".to_string()],
            }
            .to_string(),
            "ROOM_LIST General,Library"
        );
        assert_eq!(
            Reply::RoomMessage {
                payload: "[alice enters the room]".to_string(),
            }
            .to_string(),
            "ROOM_MESSAGE [alice enters the room]"
        );
        assert_eq!(
            Reply::error("Not in a room").to_string(),
            "ERROR Not in a room"
        );
    }
}
