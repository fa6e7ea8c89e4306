//! In-process stand-in for a Redis-backed store, used by this crate's own
//! test suite (and available to a host crate's tests) so [`crate::room::Room`]
//! and [`crate::manager::RoomManager`] behavior has hermetic coverage without
//! a live Redis server.
//!
//! Rather than mocking call expectations one by one, [`FakeStore`] is a small
//! real implementation of both [`CommandStore`] and [`PubSub`] backed by
//! in-memory maps and channels, which better exercises sequences of calls
//! (publish-then-read, subscribe-then-dispatch) the way the real Redis
//! backend would see them.

use super::{CommandStore, PubSub, SUBSCRIPTION_CHANNEL_CAPACITY};
use crate::error::Result;
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An in-memory [`CommandStore`] + [`PubSub`] pair.
///
/// Cloning shares the underlying state (all fields are reference-counted),
/// so a test can hold one `FakeStore`, clone it into a [`super::StoreClientPair`]
/// twice (as `command` and as `pubsub`), and still observe every write and
/// every publish from a single handle.
#[derive(Clone, Default)]
pub struct FakeStore {
    hashes: Arc<DashMap<String, HashMap<String, String>>>,
    lists: Arc<DashMap<String, Vec<String>>>,
    literal_subs: Arc<DashMap<String, mpsc::Sender<String>>>,
    pattern_subs: Arc<DashMap<String, (Regex, mpsc::Sender<String>)>>,
}

impl FakeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages published to `channel` that found no matching
    /// subscriber (neither literal nor pattern). Exposed for tests asserting
    /// on delivery rather than silent drops.
    #[must_use]
    pub fn has_subscriber(&self, channel: &str) -> bool {
        self.literal_subs.contains_key(channel)
            || self
                .pattern_subs
                .iter()
                .any(|entry| entry.value().0.is_match(channel))
    }
}

fn compile_pattern(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$")).expect("pattern compiled from escaped literal is valid")
}

#[async_trait::async_trait]
impl CommandStore for FakeStore {
    async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|r| r.clone()).unwrap_or_default())
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.insert(0, value.to_string());
        list.truncate(cap);
        Ok(())
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.lists.get(key).map(|r| r.clone()).unwrap_or_default())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.hashes.remove(key);
            self.lists.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut delivered = 0usize;
        if let Some(sender) = self.literal_subs.get(channel) {
            if sender.try_send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        for entry in self.pattern_subs.iter() {
            let (re, sender) = entry.value();
            if re.is_match(channel) && sender.try_send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let re = compile_pattern(pattern);
        let hash_keys = self.hashes.iter().map(|entry| entry.key().clone());
        let list_keys = self.lists.iter().map(|entry| entry.key().clone());
        Ok(hash_keys.chain(list_keys).filter(|k| re.is_match(k)).collect())
    }
}

#[async_trait::async_trait]
impl PubSub for FakeStore {
    async fn subscribe_literal(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        self.literal_subs.insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        self.pattern_subs.insert(pattern.to_string(), (compile_pattern(pattern), tx));
        Ok(rx)
    }

    async fn unsubscribe_literal(&self, channel: &str) {
        self.literal_subs.remove(channel);
    }

    async fn unsubscribe_pattern(&self, pattern: &str) {
        self.pattern_subs.remove(pattern);
    }
}
