//! Rooms and per-subscriber delivery queues
//!
//! A broadcast commits to room history under the room's write lock, then
//! fans out to a snapshot of the subscriber queues after the lock is
//! released. Every subscriber therefore observes the same total order of
//! broadcasts, and a slow or dead subscriber only backs up its own queue.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::server::user_store::User;

/// Maximum retained history entries per room
pub const HISTORY_CAP: usize = 1000;

/// History entries replayed to a joining subscriber
pub const JOIN_SNAPSHOT: usize = 50;

/// Pacing delay between deliveries so one queue cannot starve the writer
const PACING_DELAY: Duration = Duration::from_millis(10);

/// Pause before retrying a transiently failed delivery
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Destination for one subscriber's formatted room messages.
///
/// Implementations write one payload to the subscriber's transport. An
/// `Err` whose kind reports a closed peer permanently kills the queue.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn deliver(&self, payload: &str) -> io::Result<()>;
}

/// The transport is gone; retrying cannot help.
fn is_transport_dead(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

struct QueueState {
    queue: VecDeque<String>,
    processing: bool,
    dead: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sink: Arc<dyn DeliverySink>,
}

/// Per-subscriber FIFO with a single serial drain task
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    processing: false,
                    dead: false,
                }),
                sink,
            }),
        }
    }

    /// Append a payload and make sure a drain task is running. A dead
    /// queue swallows the payload.
    pub async fn enqueue(&self, payload: String) {
        let mut state = self.inner.state.lock().await;
        if state.dead {
            return;
        }
        state.queue.push_back(payload);
        if !state.processing {
            state.processing = true;
            eprintln!("DEBUG enqueue spawning drain, qlen={}", state.queue.len());
            tokio::spawn(drain(Arc::clone(&self.inner)));
        } else {
            eprintln!("DEBUG enqueue already processing, qlen={}", state.queue.len());
        }
    }

    pub async fn is_dead(&self) -> bool {
        self.inner.state.lock().await.dead
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }
}

/// Serial drain: deliver in order, retry transient failures in place,
/// terminate for good when the transport reports itself gone.
async fn drain(inner: Arc<QueueInner>) {
    eprintln!("DEBUG drain task started");
    loop {
        let payload = {
            let mut state = inner.state.lock().await;
            match state.queue.pop_front() {
                Some(payload) => payload,
                None => {
                    state.processing = false;
                    return;
                }
            }
        };

        match inner.sink.deliver(&payload).await {
            Ok(()) => {
                tokio::time::sleep(PACING_DELAY).await;
            }
            Err(e) if is_transport_dead(e.kind()) => {
                debug!("Subscriber transport gone ({}), dropping queue", e);
                let mut state = inner.state.lock().await;
                state.dead = true;
                state.processing = false;
                state.queue.clear();
                return;
            }
            Err(e) => {
                warn!("Transient delivery failure, retrying: {}", e);
                {
                    let mut state = inner.state.lock().await;
                    state.queue.push_front(payload);
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

struct RoomState {
    history: VecDeque<String>,
    subscribers: HashMap<String, MessageQueue>,
}

/// A chat room: bounded history plus the current subscriber set
pub struct Room {
    name: String,
    ai_prompt: Option<String>,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ai_prompt: None,
            state: RwLock::new(RoomState {
                history: VecDeque::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn new_ai(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            ai_prompt: Some(prompt.into()),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ai(&self) -> bool {
        self.ai_prompt.is_some()
    }

    pub fn ai_prompt(&self) -> Option<&str> {
        self.ai_prompt.as_deref()
    }

    /// Subscribe `user`, replaying the most recent history into its fresh
    /// queue. Rejoining replaces the previous queue; the old one is
    /// detached and left to finish or die on its own.
    ///
    /// The created queue is returned so the caller can address lines to
    /// this subscriber alone.
    pub async fn add_user(&self, user: &User, sink: Arc<dyn DeliverySink>) -> MessageQueue {
        let queue = MessageQueue::new(sink);
        let mut state = self.state.write().await;

        let skip = state.history.len().saturating_sub(JOIN_SNAPSHOT);
        eprintln!("DEBUG add_user skip={} history_len={}", skip, state.history.len());
        for entry in state.history.iter().skip(skip) {
            eprintln!("DEBUG add_user enqueue entry={:?}", entry);
            queue.enqueue(entry.clone()).await;
        }

        state
            .subscribers
            .insert(user.username().to_string(), queue.clone());
        queue
    }

    /// Unsubscribe `user`. Its queue becomes unreachable to the room.
    pub async fn remove_user(&self, user: &User) {
        let mut state = self.state.write().await;
        state.subscribers.remove(user.username());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.read().await.subscribers.len()
    }

    /// Commit one formatted line to history and hand it to every current
    /// subscriber. The append plus subscriber snapshot is the
    /// linearisation point; enqueueing happens outside the lock.
    pub async fn broadcast(&self, line: String) {
        let queues: Vec<MessageQueue> = {
            let mut state = self.state.write().await;
            state.history.push_back(line.clone());
            while state.history.len() > HISTORY_CAP {
                state.history.pop_front();
            }
            state.subscribers.values().cloned().collect()
        };

        eprintln!("DEBUG broadcast line={:?} n_queues={}", line, queues.len());
        for queue in queues {
            queue.enqueue(line.clone()).await;
        }
    }

    /// `<username>: <text>`
    pub async fn user_message(&self, user: &User, text: &str) {
        self.broadcast(format!("{}: {}", user.username(), text)).await;
    }

    /// `Bot: <text>`, embedded newlines preserved
    pub async fn bot_message(&self, text: &str) {
        self.broadcast(format!("Bot: {}", text)).await;
    }

    /// `[<text>]`
    pub async fn system_message(&self, text: &str) {
        self.broadcast(format!("[{}]", text)).await;
    }

    /// Newline-joined view of the last `count` history entries
    pub async fn history_snapshot(&self, count: usize) -> String {
        let state = self.state.read().await;
        let skip = state.history.len().saturating_sub(count);
        state
            .history
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn history_len(&self) -> usize {
        self.state.read().await.history.len()
    }
}
