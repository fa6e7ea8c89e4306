//! Redis-backed [`PubSub`]
//!
//! A single supervised task issues one broad `PSUBSCRIBE {prefix}:*:channel`
//! against a dedicated connection and then only ever reads, looping
//! `on_message()` forever, subscribing once at startup and never
//! re-subscribing for the connection's lifetime. A `redis::PubSub` connection
//! cannot interleave further `subscribe`/`psubscribe` calls with
//! `on_message()` polling, so all of this crate's dynamic
//! subscribe/unsubscribe calls are handled locally instead, by registering or
//! removing an in-process handler rather than touching the wire connection.
//!
//! Reconnection uses an exponential-backoff loop around the subscribe call.

use super::PubSub;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures_util::StreamExt;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Registered handlers, demuxed by exact channel match (literal rooms) or
/// glob match (pattern rooms), fed from the one broad subscription.
struct Handlers {
    literal: DashMap<String, mpsc::Sender<String>>,
    pattern: DashMap<String, (Regex, mpsc::Sender<String>)>,
}

impl Handlers {
    fn new() -> Self {
        Self {
            literal: DashMap::new(),
            pattern: DashMap::new(),
        }
    }

    /// Dispatch a message received on `channel` to every matching handler.
    /// Dead senders (receiver dropped) are pruned as encountered.
    fn dispatch(&self, channel: &str, payload: &str) {
        if let Some(sender) = self.literal.get(channel) {
            if sender.try_send(payload.to_string()).is_err() {
                debug!(channel = %channel, "literal subscriber channel full or closed, dropping message");
            }
        }
        self.pattern.retain(|_, (re, sender)| {
            if !re.is_match(channel) {
                return true;
            }
            if sender.try_send(payload.to_string()).is_err() {
                debug!(channel = %channel, "pattern subscriber channel full or closed, dropping message");
            }
            true
        });
    }
}

/// Compile a Redis glob pattern (only `*` is used by this crate) into a regex
/// anchored over the whole channel string.
fn compile_pattern(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$")).expect("pattern compiled from escaped literal is valid")
}

/// A [`PubSub`] backed by a real Redis server, fed by a single supervised
/// subscriber task that never re-subscribes after startup.
pub struct RedisPubSubHub {
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    channel_capacity: usize,
}

impl RedisPubSubHub {
    /// Start the subscriber task against `redis_url`, listening to every
    /// channel under `{prefix}:*:channel`. `channel_capacity` bounds each
    /// per-room handler's mpsc channel, protecting memory if a room's
    /// merge/dispatch falls behind the Redis subscribe connection.
    pub fn start(redis_url: &str, prefix: &str, channel_capacity: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
        let handlers = Arc::new(Handlers::new());
        let connected = Arc::new(AtomicBool::new(false));
        let glob = format!("{prefix}:*:channel");

        let task_handlers = handlers.clone();
        let task_connected = connected.clone();
        let task = tokio::spawn(run_subscriber(client, glob, task_handlers, task_connected));

        Ok(Self {
            handlers,
            connected,
            task: Some(task),
            channel_capacity,
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for RedisPubSubHub {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_subscriber(
    client: redis::Client,
    glob: String,
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);

    loop {
        connected.store(false, Ordering::Relaxed);
        let conn = match client.get_async_pubsub().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to open redis pubsub connection, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                continue;
            }
        };

        let mut pubsub = conn;
        if let Err(e) = pubsub.psubscribe(&glob).await {
            warn!(error = %e, pattern = %glob, "failed to psubscribe, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
            continue;
        }

        info!(pattern = %glob, "subscribed to redis pattern channel");
        connected.store(true, Ordering::Relaxed);
        backoff = Duration::from_secs(INITIAL_BACKOFF_SECS);

        let mut stream = pubsub.on_message();
        loop {
            match stream.next().await {
                Some(msg) => {
                    let channel: String = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, channel = %channel, "failed to decode pubsub payload");
                            continue;
                        }
                    };
                    handlers.dispatch(&channel, &payload);
                }
                None => {
                    error!("redis pubsub stream closed, reconnecting");
                    break;
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
    }
}

#[async_trait::async_trait]
impl PubSub for RedisPubSubHub {
    async fn subscribe_literal(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.handlers.literal.insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let re = compile_pattern(pattern);
        self.handlers.pattern.insert(pattern.to_string(), (re, tx));
        Ok(rx)
    }

    async fn unsubscribe_literal(&self, channel: &str) {
        self.handlers.literal.remove(channel);
    }

    async fn unsubscribe_pattern(&self, pattern: &str) {
        self.handlers.pattern.remove(pattern);
    }
}
