//! TLS-terminated listener
//!
//! Accepts connections, performs the TLS handshake and spawns one
//! `ConnectionHandler` task per socket. The default deployment is TLS:
//! a configured PEM identity when provided, a self-signed development
//! certificate otherwise. Plaintext serving exists only as an
//! operator-enabled diagnostic mode.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::ai::AiCompleter;
use crate::config::ServerConfig;
use crate::error::{ChatError, Result};
use crate::server::connection_handler::ConnectionHandler;
use crate::server::room_registry::RoomRegistry;
use crate::server::session::SessionRegistry;
use crate::server::user_store::UserStore;

/// Period of the background maintenance loop (session sweep, AI cache purge)
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

/// Shared server-side services handed to every connection handler
pub(crate) struct Services {
    pub(crate) config: ServerConfig,
    pub(crate) users: UserStore,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) rooms: RoomRegistry,
    pub(crate) completer: AiCompleter,
}

/// The chat server: listener plus shared state
pub struct ChatServer {
    services: Arc<Services>,
    listener: Option<TcpListener>,
    tls: Option<TlsAcceptor>,
}

impl ChatServer {
    /// Assemble the server from its configuration. Loads (or seeds) the
    /// user file and builds the upstream AI client; neither touches the
    /// network yet.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let users = UserStore::load(&config.user_file)?;
        let completer = AiCompleter::new(
            config.ai_endpoint.clone(),
            config.ai_model.clone(),
            config.ai_connect_timeout,
            config.ai_request_timeout,
            config.cache_ttl,
        )?;

        let services = Arc::new(Services {
            users,
            sessions: Arc::new(SessionRegistry::new()),
            rooms: RoomRegistry::new(),
            completer,
            config,
        });

        Ok(Self {
            services,
            listener: None,
            tls: None,
        })
    }

    /// Create the initial rooms, set up transport security and bind the
    /// listener. Returns the bound address (useful with port 0).
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let config = &self.services.config;

        self.services.rooms.create_room("General").await?;
        self.services.rooms.create_room("Library").await?;
        self.services
            .rooms
            .create_ai_room(&config.ai_room_name, &config.ai_room_prompt)
            .await?;

        self.tls = if config.allow_plaintext && config.tls_cert_path.is_none() {
            warn!("Plaintext mode enabled and no TLS identity configured; serving PLAINTEXT (diagnostics only)");
            None
        } else {
            match build_tls_acceptor(config) {
                Ok(acceptor) => Some(acceptor),
                Err(e) if config.allow_plaintext => {
                    error!("TLS setup failed ({}); falling back to PLAINTEXT (diagnostics only)", e);
                    None
                }
                Err(e) => {
                    error!("TLS setup failed: {}", e);
                    return Err(e);
                }
            }
        };

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ChatError::network(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;
        let addr = listener.local_addr()?;
        info!(
            "Chat server listening on {} ({})",
            addr,
            if self.tls.is_some() { "TLS" } else { "plaintext" }
        );

        self.listener = Some(listener);
        Ok(addr)
    }

    /// Run the accept loop. Binds first if `bind` was not called.
    pub async fn run(mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return Err(ChatError::internal("Listener vanished after bind")),
        };

        let _sweeper = self
            .services
            .sessions
            .spawn_sweeper(MAINTENANCE_PERIOD);
        let _cache_purge = spawn_cache_purge(Arc::clone(&self.services));

        let active = Arc::new(AtomicUsize::new(0));
        let max_connections = self.services.config.max_connections;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if active.load(Ordering::Relaxed) >= max_connections {
                warn!("Connection limit reached, rejecting {}", peer);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let services = Arc::clone(&self.services);
            let tls = self.tls.clone();
            let active = Arc::clone(&active);
            active.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            ConnectionHandler::new(Box::new(tls_stream), peer, services)
                                .run()
                                .await
                        }
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            Ok(())
                        }
                    },
                    None => {
                        ConnectionHandler::new(Box::new(stream), peer, services)
                            .run()
                            .await
                    }
                };
                if let Err(e) = result {
                    error!("Connection handling for {} failed: {}", peer, e);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

/// TLS identity: the configured PEM pair, or a throwaway self-signed
/// certificate for development.
fn build_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    let (certs, key) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path).map_err(|e| {
                ChatError::config(format!("Failed to read TLS cert {:?}: {}", cert_path, e))
            })?;
            let key_pem = std::fs::read(key_path).map_err(|e| {
                ChatError::config(format!("Failed to read TLS key {:?}: {}", key_path, e))
            })?;

            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ChatError::config(format!("Failed to parse TLS certificates: {}", e)))?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| ChatError::config(format!("Failed to parse TLS private key: {}", e)))?
                .ok_or_else(|| ChatError::config("No private key found in PEM file"))?;

            info!("Loaded TLS identity from {:?}", cert_path);
            (certs, key)
        }
        _ => {
            warn!("No TLS identity configured; generating a self-signed development certificate");
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).map_err(|e| {
                    ChatError::config(format!("Failed to generate certificate: {}", e))
                })?;
            let cert_der = cert.der().clone();
            let key_der =
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
            (vec![cert_der], key_der)
        }
    };

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Periodically drop expired AI cache entries.
fn spawn_cache_purge(services: Arc<Services>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_PERIOD);
        interval.tick().await;
        loop {
            interval.tick().await;
            services.completer.purge_expired().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.bind_addr = "127.0.0.1:0".parse().expect("addr");
        config.user_file = dir.path().join("users.txt");
        config.allow_plaintext = true;
        config
    }

    #[tokio::test]
    async fn test_bind_seeds_initial_rooms() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = ChatServer::new(test_config(&dir)).expect("server");
        let addr = server.bind().await.expect("bind");
        assert_ne!(addr.port(), 0);

        let rooms = &server.services.rooms;
        assert!(rooms.exists("General").await);
        assert!(rooms.exists("Library").await);
        let ai_room = rooms.get("AI Doodle").await.expect("ai room");
        assert!(ai_room.is_ai());
    }

    #[tokio::test]
    async fn test_tls_acceptor_from_self_signed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(&dir);
        config.allow_plaintext = false;
        assert!(build_tls_acceptor(&config).is_ok());
    }

    #[tokio::test]
    async fn test_missing_identity_fails_closed_without_plaintext_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(&dir);
        config.allow_plaintext = false;
        config.tls_cert_path = Some(dir.path().join("missing-cert.pem"));
        config.tls_key_path = Some(dir.path().join("missing-key.pem"));

        let mut server = ChatServer::new(config).expect("server");
        assert!(server.bind().await.is_err());
    }
}
