//! Store abstraction: the "Store Client Pair" (C2).
//!
//! Two logical connections, mirrored as two traits: [`CommandStore`] for
//! hash/list/scan/publish commands, and [`PubSub`] for subscribe/unsubscribe.
//! A Redis connection that has issued `SUBSCRIBE` can no longer issue
//! arbitrary commands, so the two concerns need separate connections in any
//! real backend.
//!
//! [`RedisCommandStore`]/[`RedisPubSubHub`] are the production backend.
//! [`fake::FakeStore`] is an in-process stand-in used by this crate's own
//! tests (and usable by a host's tests too) so the Room/Manager logic has
//! hermetic coverage without a live Redis server.

pub mod fake;
pub mod pubsub_hub;
pub mod redis_store;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use fake::FakeStore;
pub use pubsub_hub::RedisPubSubHub;
pub use redis_store::RedisCommandStore;

/// Default capacity of the per-subscription channel handed back by
/// [`fake::FakeStore`]'s [`PubSub::subscribe_literal`]/[`PubSub::subscribe_pattern`].
/// [`RedisPubSubHub`] instead takes its capacity from
/// [`crate::config::RoomManagerConfig::subscriber_channel_capacity`].
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// Command-client operations: hash, list, scan, and publish.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// `HSET key field1 value1 field2 value2 ...`. No-ops if `fields` is empty.
    async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()>;

    /// `HGETALL key`
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// `LPUSH key value` followed by `LTRIM key 0 cap-1`
    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<()>;

    /// `LRANGE key 0 -1`
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    /// `DEL key1 key2 ...`
    async fn del(&self, keys: &[String]) -> Result<()>;

    /// `PUBLISH channel payload`, returning the number of receiving subscribers
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Cursor-based `SCAN` for keys matching `pattern`, batch size 100,
    /// accumulated into a single `Vec` across all cursor iterations.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Subscribe-client operations: subscribe/unsubscribe only.
///
/// Each call registers (or removes) a local handler; the returned receiver
/// yields the raw JSON string payload of every message delivered to that
/// channel (literal) or matching that pattern (glob).
#[async_trait]
pub trait PubSub: Send + Sync {
    /// `SUBSCRIBE channel`. Returns a receiver fed with every message published
    /// to `channel` from this point forward.
    async fn subscribe_literal(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// `PSUBSCRIBE pattern`. Returns a receiver fed with every message whose
    /// channel matches the glob `pattern`.
    async fn subscribe_pattern(&self, pattern: &str) -> Result<mpsc::Receiver<String>>;

    /// `UNSUBSCRIBE channel`. Idempotent.
    async fn unsubscribe_literal(&self, channel: &str);

    /// `PUNSUBSCRIBE pattern`. Idempotent.
    async fn unsubscribe_pattern(&self, pattern: &str);
}

/// The two connections a [`crate::manager::RoomManager`] owns, shared by every
/// [`crate::room::Room`] in the process.
#[derive(Clone)]
pub struct StoreClientPair {
    pub command: Arc<dyn CommandStore>,
    pub pubsub: Arc<dyn PubSub>,
}

impl StoreClientPair {
    #[must_use]
    pub fn new(command: Arc<dyn CommandStore>, pubsub: Arc<dyn PubSub>) -> Self {
        Self { command, pubsub }
    }
}
