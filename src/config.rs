//! Server configuration
//!
//! All tunables live here, with `Default` values matching the standard
//! deployment and an environment-driven loader for operators.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default listener port
pub const DEFAULT_PORT: u16 = 8989;

/// System prompt for the default AI room
const DEFAULT_AI_ROOM_PROMPT: &str = "You are a helpful assistant who helps schedule meetings. \
     Summarize all user availability suggestions and propose a common meeting time.";

/// Chat server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// PEM certificate chain for the TLS identity; a self-signed
    /// development certificate is generated when unset
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key for the TLS identity
    pub tls_key_path: Option<PathBuf>,
    /// Serve plaintext TCP when TLS setup fails (diagnostic only)
    pub allow_plaintext: bool,
    /// Path of the persisted user file
    pub user_file: PathBuf,
    /// Upstream text-generation endpoint
    pub ai_endpoint: String,
    /// Upstream model name
    pub ai_model: String,
    /// Upstream connect timeout
    pub ai_connect_timeout: Duration,
    /// Upstream request timeout
    pub ai_request_timeout: Duration,
    /// Absolute session lifetime
    pub session_ttl: Duration,
    /// AI response cache lifetime
    pub cache_ttl: Duration,
    /// Interval between server heartbeats
    pub heartbeat_interval: Duration,
    /// Idle read timeout before a connection is considered lost
    pub read_timeout: Duration,
    /// Name of the AI room created at startup
    pub ai_room_name: String,
    /// System prompt of the AI room created at startup
    pub ai_room_prompt: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tls_cert_path: None,
            tls_key_path: None,
            allow_plaintext: false,
            user_file: PathBuf::from("users.txt"),
            ai_endpoint: "http://localhost:11434/api/generate".to_string(),
            ai_model: "llama3".to_string(),
            ai_connect_timeout: Duration::from_secs(5),
            ai_request_timeout: Duration::from_secs(20),
            session_ttl: Duration::from_secs(60 * 60),
            cache_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            ai_room_name: "AI Doodle".to_string(),
            ai_room_prompt: DEFAULT_AI_ROOM_PROMPT.to_string(),
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from `PARLOR_*` environment variables,
    /// falling back to defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("PARLOR_PORT") {
            config.bind_addr.set_port(port);
        }
        if let Ok(path) = env::var("PARLOR_TLS_CERT") {
            config.tls_cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = env::var("PARLOR_TLS_KEY") {
            config.tls_key_path = Some(PathBuf::from(path));
        }
        if let Some(allow) = env_parse::<bool>("PARLOR_ALLOW_PLAINTEXT") {
            config.allow_plaintext = allow;
        }
        if let Ok(path) = env::var("PARLOR_USER_FILE") {
            config.user_file = PathBuf::from(path);
        }
        if let Ok(url) = env::var("PARLOR_AI_URL") {
            config.ai_endpoint = url;
        }
        if let Ok(model) = env::var("PARLOR_AI_MODEL") {
            config.ai_model = model;
        }
        if let Some(secs) = env_parse::<u64>("PARLOR_AI_CONNECT_TIMEOUT_SECONDS") {
            config.ai_connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PARLOR_AI_TIMEOUT_SECONDS") {
            config.ai_request_timeout = Duration::from_secs(secs);
        }
        if let Some(minutes) = env_parse::<u64>("PARLOR_SESSION_TTL_MINUTES") {
            config.session_ttl = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = env_parse::<u64>("PARLOR_CACHE_TTL_SECONDS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PARLOR_HEARTBEAT_SECONDS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PARLOR_READ_TIMEOUT_SECONDS") {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Ok(name) = env::var("PARLOR_AI_ROOM") {
            config.ai_room_name = name;
        }
        if let Ok(prompt) = env::var("PARLOR_AI_PROMPT") {
            config.ai_room_prompt = prompt;
        }
        if let Some(max) = env_parse::<usize>("PARLOR_MAX_CONNECTIONS") {
            config.max_connections = max;
        }

        config
    }
}

/// Parse an environment variable, warning (and ignoring it) when the
/// value does not parse.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}
