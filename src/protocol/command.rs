//! Client commands
//!
//! Parsing mirrors the wire grammar exactly: the first space-delimited
//! word selects the command, the remainder is payload. Room names,
//! passwords and message bodies may contain spaces.

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { username: String, password: String },
    Register { username: String, password: String },
    Reconnect { token: String, room: Option<String> },
    ListRooms,
    JoinRoom { name: String },
    CreateRoom { name: String },
    CreateAiRoom { name: String, prompt: String },
    Message { text: String },
    LeaveRoom,
    Logout,
    Heartbeat,
    HeartbeatAck,
}

/// Why a line failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Known command with the wrong shape
    InvalidFormat,
    /// `CREATE_AI_ROOM` payload missing the `name|prompt` separator
    InvalidAiRoomFormat,
    /// Unrecognized command word
    UnknownCommand,
}

impl Command {
    /// Parse one wire line into a command.
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, Some(rest)),
            None => (line, None),
        };

        match word {
            "LIST_ROOMS" => Ok(Command::ListRooms),
            "LEAVE_ROOM" => Ok(Command::LeaveRoom),
            "LOGOUT" => Ok(Command::Logout),
            "HEARTBEAT" => Ok(Command::Heartbeat),
            "HEARTBEAT_ACK" => Ok(Command::HeartbeatAck),
            "LOGIN" => {
                let (username, password) = credentials(rest)?;
                Ok(Command::Login { username, password })
            }
            "REGISTER" => {
                let (username, password) = credentials(rest)?;
                Ok(Command::Register { username, password })
            }
            "RECONNECT" => {
                let rest = rest.ok_or(ParseError::InvalidFormat)?;
                let (token, room) = match rest.split_once(' ') {
                    Some((token, room)) => (token.to_string(), Some(room.to_string())),
                    None => (rest.to_string(), None),
                };
                Ok(Command::Reconnect { token, room })
            }
            "JOIN_ROOM" => {
                let name = rest.ok_or(ParseError::InvalidFormat)?;
                Ok(Command::JoinRoom {
                    name: name.to_string(),
                })
            }
            "CREATE_ROOM" => {
                let name = rest.ok_or(ParseError::InvalidFormat)?;
                Ok(Command::CreateRoom {
                    name: name.to_string(),
                })
            }
            "CREATE_AI_ROOM" => {
                let rest = rest.ok_or(ParseError::InvalidFormat)?;
                match rest.split_once('|') {
                    Some((name, prompt)) => Ok(Command::CreateAiRoom {
                        name: name.to_string(),
                        prompt: prompt.to_string(),
                    }),
                    None => Err(ParseError::InvalidAiRoomFormat),
                }
            }
            "MESSAGE" => {
                let text = rest.ok_or(ParseError::InvalidFormat)?;
                Ok(Command::Message {
                    text: text.to_string(),
                })
            }
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

fn credentials(rest: Option<&str>) -> Result<(String, String), ParseError> {
    let rest = rest.ok_or(ParseError::InvalidFormat)?;
    match rest.split_once(' ') {
        Some((username, password)) => Ok((username.to_string(), password.to_string())),
        None => Err(ParseError::InvalidFormat),
    }
}
