//! AI room participant
//!
//! Builds prompts from recent room history, calls the upstream
//! text-generation endpoint, and caches responses by content
//! fingerprint. The pipeline never surfaces an error to the room: a
//! failed primary request falls back to a simplified one, and a failed
//! fallback yields a fixed apology line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};

/// Fixed instructions prepended to every room prompt
const PREAMBLE: &str = "You are participating in a casual chat room. \
     Respond naturally to the most recent message in the conversation. \
     Speak in the same language as the user (Portuguese if they use Portuguese). \
     Never start with phrases like 'Based on our conversation history'. \
     Never mention analyzing the conversation. \
     Be concise, natural, and conversational. ";

/// Reply of last resort when both request paths fail
pub const APOLOGY: &str = "Sorry, I'm having technical difficulties processing your message \
     right now. Please try again in a few moments.";

/// Tail-most message-shaped history lines sent upstream
const CONTEXT_MESSAGES: usize = 8;

/// Function words that mark a conversation as Portuguese
const PORTUGUESE_MARKERS: &[&str] = &[
    "como", "está", "olá", "bom dia", "boa tarde", "obrigado", "não", "qual", "para",
];

struct CacheEntry {
    response: String,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Upstream response envelope; other fields are ignored
#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
}

/// Client for the upstream text-generation service
pub struct AiCompleter {
    client: Client,
    endpoint: String,
    model: String,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
}

impl AiCompleter {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChatError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Produce a reply for the given room prompt and history snapshot.
    ///
    /// Always returns text: a cached reply, a fresh upstream reply, a
    /// simplified-fallback reply, or the apology string. An empty result
    /// means the upstream answered with nothing usable; the caller
    /// decides what to tell the room.
    pub async fn complete(&self, prompt: &str, context: &str) -> String {
        let request_id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;

        let latest = extract_latest_messages(context, CONTEXT_MESSAGES);
        let key = fingerprint(prompt, &latest);

        if let Some(cached) = self.cached(&key).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("[ai#{}] serving cached response", request_id);
            return cached;
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.primary_request(prompt, &latest, request_id).await {
            Ok(raw) => {
                let response = clean_response(&raw);
                if !response.is_empty() {
                    let mut cache = self.cache.write().await;
                    cache.insert(
                        key,
                        CacheEntry {
                            response: response.clone(),
                            created_at: Instant::now(),
                        },
                    );
                    debug!("[ai#{}] response stored in cache", request_id);
                }
                response
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("[ai#{}] primary request failed: {}", request_id, e);

                match self.simplified_request(context, request_id).await {
                    Ok(raw) => clean_response(&raw),
                    Err(e2) => {
                        warn!("[ai#{}] fallback request failed: {}", request_id, e2);
                        APOLOGY.to_string()
                    }
                }
            }
        }
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        let entry = cache.get(key)?;
        if entry.is_expired(self.cache_ttl) {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Role-tagged transcript plus the room's system prompt
    async fn primary_request(
        &self,
        prompt: &str,
        context: &str,
        request_id: u64,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "prompt": format!("{}<assistant>", role_tagged_transcript(context)),
            "system": format!("{}{}", PREAMBLE, prompt),
            "stream": false,
            "options": {"temperature": 0.8, "top_p": 0.9, "top_k": 40},
        });

        debug!("[ai#{}] sending primary request", request_id);
        self.send(&body, request_id).await
    }

    /// One-shot prompt around the last user line, in the detected language
    async fn simplified_request(&self, context: &str, request_id: u64) -> Result<String> {
        let template = if looks_portuguese(context) {
            "Responda de forma natural e conversacional: "
        } else {
            "Respond naturally and conversationally: "
        };
        let body = json!({
            "model": self.model,
            "prompt": format!("<assistant>{}{}</assistant>", template, last_user_query(context)),
            "stream": false,
        });

        debug!("[ai#{}] retrying with simplified prompt", request_id);
        self.send(&body, request_id).await
    }

    async fn send(&self, body: &serde_json::Value, request_id: u64) -> Result<String> {
        let started = Instant::now();
        let response = self.client.post(&self.endpoint).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatError::upstream(format!("HTTP {}: {}", status, detail)));
        }

        let reply: GenerateReply = response.json().await?;
        debug!(
            "[ai#{}] request completed in {}ms",
            request_id,
            started.elapsed().as_millis()
        );
        Ok(reply.response)
    }

    /// Drop expired cache entries.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired(self.cache_ttl));
        let removed = before - cache.len();
        if removed > 0 {
            info!(
                "Cache cleanup: {} expired entries removed, {} remaining",
                removed,
                cache.len()
            );
        }
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_miss_count(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Human-readable usage report
    pub async fn stats(&self) -> String {
        let requests = self.request_count();
        let hits = self.cache_hit_count();
        let hit_rate = if requests > 0 {
            hits as f64 * 100.0 / requests as f64
        } else {
            0.0
        };
        format!(
            "AiCompleter stats: requests={}, cache hits={}, cache misses={}, \
             failures={}, hit rate={:.1}%, cache size={}",
            requests,
            hits,
            self.cache_miss_count(),
            self.failure_count(),
            hit_rate,
            self.cache.read().await.len()
        )
    }
}

/// Keep the tail-most `count` lines that look like messages: either
/// `name: text` or a bracketed system line. Relative order is preserved
/// and each kept line stays newline-terminated.
fn extract_latest_messages(context: &str, count: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in context.lines().rev() {
        if kept.len() >= count {
            break;
        }
        if line.contains(": ") || (line.starts_with('[') && line.ends_with(']')) {
            kept.push(line);
        }
    }
    kept.reverse();

    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// SHA-256 over `prompt ∥ 0x00 ∥ context`, hex-encoded
fn fingerprint(prompt: &str, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    hex::encode(hasher.finalize())
}

/// Encode history lines as a role-tagged transcript
fn role_tagged_transcript(context: &str) -> String {
    let mut out = String::new();
    for line in context.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(text) = line.strip_prefix("Bot: ") {
            out.push_str("<assistant>");
            out.push_str(text);
            out.push_str("</assistant>\n");
        } else if let Some((name, text)) = line.split_once(": ") {
            out.push_str("<user name=\"");
            out.push_str(name);
            out.push_str("\">");
            out.push_str(text);
            out.push_str("</user>\n");
        } else if line.starts_with('[') && line.ends_with(']') {
            out.push_str("<system_message>");
            out.push_str(line);
            out.push_str("</system_message>\n");
        }
    }
    out
}

/// Keyword-membership heuristic; only chooses between two prompt
/// templates, so false negatives are harmless.
fn looks_portuguese(context: &str) -> bool {
    if context.is_empty() {
        return false;
    }
    let lower = context.to_lowercase();
    PORTUGUESE_MARKERS.iter().any(|marker| {
        lower.contains(&format!(" {} ", marker))
            || lower.starts_with(&format!("{} ", marker))
            || lower.contains(&format!(" {}\n", marker))
    })
}

/// Content of the last non-bot `name: text` line
fn last_user_query(context: &str) -> &str {
    for line in context.lines().rev() {
        if line.starts_with("Bot:") {
            continue;
        }
        if let Some(pos) = line.find(": ") {
            if pos > 0 && pos + 2 < line.len() {
                return &line[pos + 2..];
            }
        }
    }
    "How can I help?"
}

/// Strip wrapping assistant markers and un-escape the angle brackets the
/// upstream leaves double-encoded.
fn clean_response(response: &str) -> String {
    response
        .replace("<assistant>", "")
        .replace("</assistant>", "")
        .replace("\\u003c", "<")
        .replace("\\u003e", ">")
}
