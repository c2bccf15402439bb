//! Per-connection protocol driver
//!
//! Each accepted socket gets one handler task running a small state
//! machine: `PreAuth` until credentials or a session token check out,
//! then `Lobby` and `InRoom`. A heartbeat task shares the write half;
//! a failed heartbeat write or a dead read ends the connection.
//!
//! Cleanup is split into two explicit paths: transport loss keeps the
//! session (and its remembered room) alive for a later `RECONNECT`,
//! while `LOGOUT` invalidates it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::{Command, ParseError, Reply};
use crate::server::chat_server::Services;
use crate::server::room::{DeliverySink, Room};
use crate::server::session::Session;

/// History lines handed to the AI pipeline per completion
const AI_CONTEXT_LINES: usize = 100;

/// Anything that can carry the line protocol (TLS or plaintext socket)
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport for T {}

type SharedWriter = Arc<Mutex<WriteHalf<Box<dyn Transport>>>>;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Waiting for LOGIN, REGISTER or RECONNECT
    PreAuth,
    /// Authenticated, not subscribed to any room
    Lobby,
    /// Authenticated and subscribed
    InRoom,
}

/// How the read loop ended
enum Exit {
    /// EOF, read/write error, timeout or heartbeat failure
    Disconnect,
    /// Explicit LOGOUT
    Logout,
}

enum Flow {
    Continue,
    Logout,
}

/// Writes room traffic for one subscriber through the shared writer
struct ClientSink {
    writer: SharedWriter,
}

#[async_trait]
impl DeliverySink for ClientSink {
    async fn deliver(&self, payload: &str) -> io::Result<()> {
        eprintln!("DEBUG deliver payload={:?}", payload);
        let mut writer = self.writer.lock().await;
        writer.write_all(b"ROOM_MESSAGE ").await?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

/// Per-connection handler driving the protocol state machine
pub struct ConnectionHandler {
    conn_id: String,
    peer: SocketAddr,
    lines: Lines<BufReader<ReadHalf<Box<dyn Transport>>>>,
    writer: SharedWriter,
    sink: Arc<dyn DeliverySink>,
    services: Arc<Services>,
    state: ConnState,
    session: Option<Arc<Session>>,
    current_room: Option<Arc<Room>>,
}

impl ConnectionHandler {
    pub fn new(stream: Box<dyn Transport>, peer: SocketAddr, services: Arc<Services>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));
        let sink: Arc<dyn DeliverySink> = Arc::new(ClientSink {
            writer: Arc::clone(&writer),
        });

        Self {
            conn_id: uuid::Uuid::new_v4().to_string(),
            peer,
            lines: BufReader::new(read_half).lines(),
            writer,
            sink,
            services,
            state: ConnState::PreAuth,
            session: None,
            current_room: None,
        }
    }

    /// Drive the connection to completion. This is the task entry point.
    pub async fn run(mut self) -> Result<()> {
        info!("New connection {} from {}", self.conn_id, self.peer);
        self.send(Reply::AuthRequired).await?;

        let mut heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.writer),
            self.services.config.heartbeat_interval,
        ));
        let read_timeout = self.services.config.read_timeout;

        let exit = loop {
            let line = tokio::select! {
                _ = &mut heartbeat => {
                    debug!("Heartbeat to {} failed, closing connection", self.peer);
                    break Exit::Disconnect;
                }
                line = tokio::time::timeout(read_timeout, self.lines.next_line()) => line,
            };

            let line = match line {
                Err(_) => {
                    info!("Read timeout from {}", self.peer);
                    break Exit::Disconnect;
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!("Peer {} closed the connection", self.peer);
                    break Exit::Disconnect;
                }
                Ok(Err(e)) => {
                    warn!("Read error from {}: {}", self.peer, e);
                    break Exit::Disconnect;
                }
            };

            match self.handle_line(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Logout) => break Exit::Logout,
                Err(e) => {
                    warn!("Dropping connection {}: {}", self.peer, e);
                    break Exit::Disconnect;
                }
            }
        };

        heartbeat.abort();

        match exit {
            Exit::Disconnect => self.on_disconnect().await,
            Exit::Logout => self.on_logout().await,
        }

        info!("Connection {} from {} closed", self.conn_id, self.peer);
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(ParseError::InvalidFormat) => {
                self.send(Reply::InvalidFormat).await?;
                return Ok(Flow::Continue);
            }
            Err(ParseError::InvalidAiRoomFormat) => {
                self.send(Reply::InvalidFormatAiRoom).await?;
                return Ok(Flow::Continue);
            }
            Err(ParseError::UnknownCommand) => {
                self.send(Reply::UnknownCommand).await?;
                return Ok(Flow::Continue);
            }
        };

        match (self.state, command) {
            // Pre-auth: only the three auth commands, plus tolerated
            // heartbeat ACKs from clients racing the handshake
            (ConnState::PreAuth, Command::Login { username, password }) => {
                self.handle_login(&username, &password).await?;
            }
            (ConnState::PreAuth, Command::Register { username, password }) => {
                self.handle_register(&username, &password).await?;
            }
            (ConnState::PreAuth, Command::Reconnect { token, room }) => {
                self.handle_reconnect(&token, room).await?;
            }
            (ConnState::PreAuth, Command::HeartbeatAck) => {}
            (ConnState::PreAuth, _) => {
                self.send(Reply::UnknownCommand).await?;
            }

            // In-room extras
            (ConnState::InRoom, Command::Message { text }) => {
                self.handle_message(&text).await?;
            }
            (ConnState::InRoom, Command::LeaveRoom) => {
                self.leave_current_room(true).await?;
            }
            (_, Command::Message { .. }) | (_, Command::LeaveRoom) => {
                self.send(Reply::error("Not in a room")).await?;
            }

            // Lobby and in-room
            (_, Command::ListRooms) => {
                self.send_room_list().await?;
            }
            (_, Command::JoinRoom { name }) => {
                self.handle_join(&name).await?;
            }
            (_, Command::CreateRoom { name }) => {
                self.handle_create(&name, None).await?;
            }
            (_, Command::CreateAiRoom { name, prompt }) => {
                self.handle_create(&name, Some(prompt)).await?;
            }
            (_, Command::Logout) => {
                self.send(Reply::LoggedOut).await?;
                return Ok(Flow::Logout);
            }
            (_, Command::Heartbeat) => {
                self.send(Reply::HeartbeatAck).await?;
            }
            (_, Command::HeartbeatAck) => {}

            // Auth commands after auth
            (_, Command::Login { .. })
            | (_, Command::Register { .. })
            | (_, Command::Reconnect { .. }) => {
                self.send(Reply::UnknownCommand).await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_login(&mut self, username: &str, password: &str) -> Result<()> {
        match self.services.users.authenticate(username, password).await {
            Some(user) => {
                let session = self
                    .services
                    .sessions
                    .create(user, self.services.config.session_ttl)
                    .await;
                info!("User {} authenticated from {}", username, self.peer);
                self.send(Reply::AuthSuccess {
                    username: username.to_string(),
                    token: session.token().to_string(),
                })
                .await?;
                self.session = Some(session);
                self.state = ConnState::Lobby;
                self.send_room_list().await?;
            }
            None => {
                info!("Authentication failed for {:?} from {}", username, self.peer);
                self.send(Reply::AuthFailed).await?;
            }
        }
        Ok(())
    }

    async fn handle_register(&mut self, username: &str, password: &str) -> Result<()> {
        match self.services.users.register(username, password).await {
            Ok(true) => {
                info!("Registered user {}", username);
                self.send(Reply::RegisterSuccess).await?;
            }
            Ok(false) => {
                self.send(Reply::RegisterFailed {
                    reason: "User already exists".to_string(),
                })
                .await?;
            }
            Err(e) => {
                error!("Registration of {} failed: {}", username, e);
                self.send(Reply::RegisterFailed {
                    reason: "Storage failure".to_string(),
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Reattach a surviving session, restoring its room when it still
    /// resolves. No "enters the room" broadcast: the room never saw the
    /// user leave. The replayed history is followed by a reconnect
    /// marker addressed to this client only.
    async fn handle_reconnect(&mut self, token: &str, room_arg: Option<String>) -> Result<()> {
        let session = match self.services.sessions.get(token).await {
            Some(session) => session,
            None => {
                info!("Reconnect from {} with expired or unknown token", self.peer);
                self.send(Reply::SessionExpired).await?;
                return Ok(());
            }
        };

        let username = session.user().username().to_string();
        let room_name = match room_arg {
            Some(name) => Some(name),
            None => session.current_room().await,
        };
        let room = match &room_name {
            Some(name) => self.services.rooms.get(name).await,
            None => None,
        };
        if room.is_none() && room_name.is_some() {
            // Room gone between sessions: fall back to the lobby
            session.set_current_room(None).await;
        }

        self.session = Some(Arc::clone(&session));

        match room {
            Some(room) => {
                session.set_current_room(Some(room.name().to_string())).await;
                self.send(Reply::ReconnectSuccess {
                    username: username.clone(),
                    room: Some(room.name().to_string()),
                })
                .await?;

                let queue = room.add_user(session.user(), Arc::clone(&self.sink)).await;
                queue
                    .enqueue(format!("[System: Reconnected to room {}]", room.name()))
                    .await;

                info!("Reconnected user {} to room {}", username, room.name());
                self.current_room = Some(room);
                self.state = ConnState::InRoom;
            }
            None => {
                self.send(Reply::ReconnectSuccess {
                    username: username.clone(),
                    room: None,
                })
                .await?;
                info!("Reconnected user {} to the lobby", username);
                self.state = ConnState::Lobby;
                self.send_room_list().await?;
            }
        }
        Ok(())
    }

    async fn handle_join(&mut self, name: &str) -> Result<()> {
        if self.state == ConnState::InRoom {
            self.leave_current_room(true).await?;
        }

        let room = match self.services.rooms.get(name).await {
            Some(room) => room,
            None => {
                self.send(Reply::error("Room not found")).await?;
                return Ok(());
            }
        };

        let session = self.session()?;
        session.set_current_room(Some(room.name().to_string())).await;
        eprintln!("DEBUG handle_join history_len={}", room.history_len().await);
        room.add_user(session.user(), Arc::clone(&self.sink)).await;

        self.send(Reply::JoinedRoom {
            name: room.name().to_string(),
        })
        .await?;
        room.system_message(&format!("{} enters the room", session.user().username()))
            .await;

        debug!("{} joined room {}", session.user().username(), room.name());
        self.current_room = Some(room);
        self.state = ConnState::InRoom;
        Ok(())
    }

    async fn handle_create(&mut self, name: &str, ai_prompt: Option<String>) -> Result<()> {
        let created = match &ai_prompt {
            Some(prompt) => self.services.rooms.create_ai_room(name, prompt).await,
            None => self.services.rooms.create_room(name).await,
        };

        match created {
            Ok(room) => {
                info!(
                    "Created {} room {}",
                    if room.is_ai() { "AI" } else { "chat" },
                    room.name()
                );
                let reply = if room.is_ai() {
                    Reply::AiRoomCreated {
                        name: room.name().to_string(),
                    }
                } else {
                    Reply::RoomCreated {
                        name: room.name().to_string(),
                    }
                };
                self.send(reply).await?;
                self.handle_join(name).await
            }
            Err(ChatError::RoomExists(_)) => {
                self.send(Reply::error("Room already exists")).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commit the user's line, then (for AI rooms) kick off a completion
    /// that re-enters the room as a bot message. The AI is a concurrent
    /// participant: other traffic may interleave before its reply lands.
    async fn handle_message(&mut self, text: &str) -> Result<()> {
        let room = match &self.current_room {
            Some(room) => Arc::clone(room),
            None => {
                self.send(Reply::error("Not in a room")).await?;
                return Ok(());
            }
        };
        let session = self.session()?;

        room.user_message(session.user(), text).await;

        if room.is_ai() {
            let prompt = room.ai_prompt().unwrap_or_default().to_string();
            let context = room.history_snapshot(AI_CONTEXT_LINES).await;
            let services = Arc::clone(&self.services);

            tokio::spawn(async move {
                debug!("Requesting AI response for room {}", room.name());
                let reply = services.completer.complete(&prompt, &context).await;
                if reply.trim().is_empty() {
                    warn!("Empty AI response for room {}", room.name());
                    room.system_message("Error: Bot did not generate a valid response")
                        .await;
                } else {
                    room.bot_message(&reply).await;
                }
            });
        }
        Ok(())
    }

    /// Leave the current room, optionally announcing the departure.
    async fn leave_current_room(&mut self, announce: bool) -> Result<()> {
        if let Some(room) = self.current_room.take() {
            let session = self.session()?;
            if announce {
                room.system_message(&format!("{} leaves the room", session.user().username()))
                    .await;
            }
            room.remove_user(session.user()).await;
            session.set_current_room(None).await;
            self.state = ConnState::Lobby;
            self.send(Reply::LeftRoom).await?;
        } else {
            self.send(Reply::error("Not in a room")).await?;
        }
        Ok(())
    }

    /// Soft cleanup: the transport died without a LOGOUT. The subscriber
    /// leaves the room silently and the session keeps its room name so a
    /// RECONNECT can restore it.
    async fn on_disconnect(&mut self) {
        if let Some(room) = self.current_room.take() {
            if let Some(session) = &self.session {
                room.remove_user(session.user()).await;
                info!(
                    "Keeping {} associated with room {} for future reconnection",
                    session.user().username(),
                    room.name()
                );
            }
        }
    }

    /// Hard cleanup: explicit LOGOUT. The departure is announced, the
    /// session is invalidated and forgets its room.
    async fn on_logout(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(room) = self.current_room.take() {
                room.system_message(&format!("{} leaves the room", session.user().username()))
                    .await;
                room.remove_user(session.user()).await;
            }
            session.set_current_room(None).await;
            self.services.sessions.remove(session.token()).await;
            info!("User {} logged out", session.user().username());
        }
    }

    async fn send_room_list(&self) -> Result<()> {
        let names = self.services.rooms.names().await;
        self.send(Reply::RoomList { names }).await
    }

    async fn send(&self, reply: Reply) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(reply.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .clone()
            .ok_or_else(|| ChatError::internal("No session in authenticated state"))
    }
}

/// Emit HEARTBEAT on the shared writer until a write fails.
async fn heartbeat_loop(writer: SharedWriter, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let mut guard = writer.lock().await;
        let result = async {
            guard.write_all(b"HEARTBEAT\n").await?;
            guard.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("Heartbeat write failed: {}", e);
            return;
        }
    }
}
