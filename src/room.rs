//! Per-room state machine (C3): lazy-initialized snapshot cache, history
//! buffer, callback registry, subscribe/unsubscribe, and merge+dispatch on
//! incoming messages.
//!
//! Grounded on `synctv-cluster::sync::room_hub::RoomMessageHub` for the
//! subscriber-registry/fan-out shape, and on
//! `synctv-core::cache::singleflight::SingleFlight` (via [`crate::singleflight`])
//! for the lazy single-flight initialization protocol.

use crate::error::{Error, Result};
use crate::keys::{KeyTriple, RoomName};
use crate::payload::{self, Payload};
use crate::singleflight::{SingleFlight, SingleFlightError};
use crate::store::StoreClientPair;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, warn};

/// A registered callback: `onData(fullData, newData, extraData)`.
pub type Callback = Arc<dyn Fn(&Payload, Option<&Payload>, Option<&Value>) + Send + Sync>;

/// Per-room options. Immutable after first use except `enable_publish`,
/// which may be upgraded false -> true on a second `createRoom` acquisition.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Maintain the snapshot cache and deliver `fullData` to callbacks.
    pub enable_full_data: bool,
    /// Cap for the history buffer; 0 disables history.
    pub history_length: usize,
    /// Marks this room a producer: exempt from idle reaping, allows `publish`.
    pub enable_publish: bool,
    /// On this producer's first publish, delete the existing snapshot/history
    /// keys before writing.
    pub clean_on_startup: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            enable_full_data: true,
            history_length: 0,
            enable_publish: false,
            clean_on_startup: false,
        }
    }
}

/// A per-`publish` override of the room's own [`RoomOptions`]. Fields left
/// `None` inherit the room's configured value instead of being reset to a
/// default; `Room::publish` merges this onto the room's options field by
/// field rather than replacing the struct wholesale.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomOptionsOverride {
    pub enable_full_data: Option<bool>,
    pub history_length: Option<usize>,
    pub enable_publish: Option<bool>,
    pub clean_on_startup: Option<bool>,
}

impl RoomOptionsOverride {
    fn merge_onto(self, base: RoomOptions) -> RoomOptions {
        RoomOptions {
            enable_full_data: self.enable_full_data.unwrap_or(base.enable_full_data),
            history_length: self.history_length.unwrap_or(base.history_length),
            enable_publish: self.enable_publish.unwrap_or(base.enable_publish),
            clean_on_startup: self.clean_on_startup.unwrap_or(base.clean_on_startup),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomState {
    Uninitialized,
    Initializing,
    Initialized,
    Destroyed,
}

struct CallbackEntry {
    callback: Callback,
    extra_data: Option<Value>,
}

/// A single room's local cache, subscription, and callback registry.
///
/// Shared between the [`crate::manager::RoomManager`] (the authoritative
/// owner) and any caller holding an `Arc<Room>` obtained via `createRoom`/
/// `getRoom`. Callers must not use a Room after `destroy()` returns.
pub struct Room {
    name: RoomName,
    keys: KeyTriple,
    options: RwLock<RoomOptions>,
    store: StoreClientPair,
    snapshot: RwLock<Payload>,
    history: RwLock<Vec<Payload>>,
    callbacks: DashMap<String, CallbackEntry>,
    idle_since: RwLock<Option<DateTime<Utc>>>,
    state: RwLock<RoomState>,
    init_guard: SingleFlight<(), (), Error>,
    cleaned: AtomicBool,
    message_task: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub(crate) fn new(
        name: RoomName,
        keys: KeyTriple,
        opts: RoomOptions,
        store: StoreClientPair,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            keys,
            options: RwLock::new(opts),
            store,
            snapshot: RwLock::new(Payload::new()),
            history: RwLock::new(Vec::new()),
            callbacks: DashMap::new(),
            idle_since: RwLock::new(None),
            state: RwLock::new(RoomState::Uninitialized),
            init_guard: SingleFlight::new(),
            cleaned: AtomicBool::new(false),
            message_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn name(&self) -> &RoomName {
        &self.name
    }

    pub(crate) async fn upgrade_to_producer(&self) {
        self.options.write().await.enable_publish = true;
    }

    /// `publish(data, overrideOpts?)` -- producers only. `override_opts`
    /// fields left unset inherit the room's own configured options.
    pub async fn publish(&self, data: Payload, override_opts: Option<RoomOptionsOverride>) -> Result<()> {
        let opts = self.options.read().await.clone();
        if !opts.enable_publish {
            return Err(Error::NotAProducer(self.name.to_string()));
        }
        if opts.clean_on_startup && !self.cleaned.swap(true, Ordering::SeqCst) {
            self.store
                .command
                .del(&[self.keys.hash.clone(), self.keys.list.clone()])
                .await?;
        }
        let effective = match override_opts {
            Some(o) => o.merge_onto(opts),
            None => opts,
        };
        crate::manager::publish_stateless(&self.store, &self.keys, &data, &effective).await
    }

    /// `join(userId, onData, extraData?)` -- consumers.
    pub async fn join(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        on_data: Callback,
        extra_data: Option<Value>,
    ) -> Result<()> {
        let user_id = user_id.into();
        *self.idle_since.write().await = None;
        self.callbacks.insert(
            user_id.clone(),
            CallbackEntry {
                callback: on_data,
                extra_data,
            },
        );

        self.ensure_initialized().await?;

        if let Some(entry) = self.callbacks.get(&user_id) {
            let snapshot = payload::deep_copy(&*self.snapshot.read().await);
            let cb = entry.callback.clone();
            let extra = entry.extra_data.clone();
            drop(entry);
            self.invoke_callback(&user_id, &cb, &snapshot, None, extra.as_ref());
        }
        Ok(())
    }

    /// `leave(userId)`.
    pub async fn leave(&self, user_id: &str) {
        self.callbacks.remove(user_id);
        if self.callbacks.is_empty() && *self.state.read().await == RoomState::Initialized {
            *self.idle_since.write().await = Some(Utc::now());
        }
    }

    /// `getFullData()`.
    pub async fn get_full_data(self: &Arc<Self>) -> Result<Payload> {
        self.ensure_initialized().await?;
        Ok(payload::deep_copy(&*self.snapshot.read().await))
    }

    /// `getHistoryData()`.
    pub async fn get_history_data(self: &Arc<Self>) -> Result<Vec<Payload>> {
        self.ensure_initialized().await?;
        Ok(self.history.read().await.clone())
    }

    /// `destroy()`. Idempotent.
    pub async fn destroy(&self) {
        let mut state = self.state.write().await;
        if *state == RoomState::Destroyed {
            return;
        }
        if *state == RoomState::Initialized {
            if self.name.is_pattern() {
                self.store.pubsub.unsubscribe_pattern(&self.keys.channel).await;
            } else {
                self.store.pubsub.unsubscribe_literal(&self.keys.channel).await;
            }
        }
        if let Some(handle) = self.message_task.lock().await.take() {
            handle.abort();
        }
        self.callbacks.clear();
        *self.idle_since.write().await = None;
        *state = RoomState::Destroyed;
    }

    pub(crate) async fn is_reapable(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.options.read().await.enable_publish {
            return false;
        }
        if *self.state.read().await != RoomState::Initialized {
            return false;
        }
        if !self.callbacks.is_empty() {
            return false;
        }
        match *self.idle_since.read().await {
            Some(since) => now
                .signed_duration_since(since)
                .to_std()
                .map(|elapsed| elapsed > idle_timeout)
                .unwrap_or(false),
            None => false,
        }
    }

    // -- initialization -------------------------------------------------

    async fn ensure_initialized(self: &Arc<Self>) -> Result<()> {
        if *self.state.read().await == RoomState::Initialized {
            return Ok(());
        }
        let room = self.clone();
        self.init_guard
            .do_work((), async move { room.do_initialize().await })
            .await
            .map_err(|e| match e {
                SingleFlightError::Inner(err) => err,
                SingleFlightError::WorkerFailed => Error::Initialization {
                    name: self.name.to_string(),
                    source: Box::new(Error::Timeout("initialization worker failed".to_string())),
                },
            })
    }

    async fn do_initialize(self: Arc<Self>) -> Result<()> {
        *self.state.write().await = RoomState::Initializing;
        match self.fetch_and_subscribe().await {
            Ok(()) => {
                *self.state.write().await = RoomState::Initialized;
                if self.callbacks.is_empty() {
                    *self.idle_since.write().await = Some(Utc::now());
                }
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = RoomState::Uninitialized;
                Err(e.into_initialization(self.name.as_str()))
            }
        }
    }

    async fn fetch_and_subscribe(self: &Arc<Self>) -> Result<()> {
        let (snapshot, history) = if self.name.is_pattern() {
            self.fetch_pattern().await?
        } else {
            self.fetch_literal().await?
        };
        *self.snapshot.write().await = snapshot;
        *self.history.write().await = history;
        self.subscribe().await
    }

    async fn fetch_literal(&self) -> Result<(Payload, Vec<Payload>)> {
        let opts = self.options.read().await.clone();

        let snapshot = if opts.enable_full_data {
            let fields = self.store.command.hgetall(&self.keys.hash).await?;
            payload::decode_hash_to_snapshot(fields)
        } else {
            Payload::new()
        };

        let history = if opts.history_length > 0 {
            let raw = self.store.command.lrange_all(&self.keys.list).await?;
            decode_history(raw, opts.history_length)
        } else {
            Vec::new()
        };

        Ok((snapshot, history))
    }

    /// Pattern-mode aggregation: `SCAN` for every matching hash/list key,
    /// merge snapshots (last write wins, order undefined), concatenate
    /// history. A single key's fetch error is logged and skipped; it does
    /// not fail the whole aggregation.
    async fn fetch_pattern(&self) -> Result<(Payload, Vec<Payload>)> {
        let opts = self.options.read().await.clone();
        let mut snapshot = Payload::new();
        let mut history = Vec::new();

        if opts.enable_full_data {
            let hash_keys = self.store.command.scan_match(&self.keys.hash).await?;
            for key in hash_keys {
                match self.store.command.hgetall(&key).await {
                    Ok(fields) => {
                        let decoded = payload::decode_hash_to_snapshot(fields);
                        payload::merge_into(&mut snapshot, &decoded);
                    }
                    Err(e) => {
                        warn!(room = %self.name, key = %key, error = %e, "skipping key after fetch error during pattern aggregation");
                    }
                }
            }
        }

        if opts.history_length > 0 {
            let list_keys = self.store.command.scan_match(&self.keys.list).await?;
            for key in list_keys {
                match self.store.command.lrange_all(&key).await {
                    Ok(raw) => history.extend(decode_history(raw, usize::MAX)),
                    Err(e) => {
                        warn!(room = %self.name, key = %key, error = %e, "skipping key after fetch error during pattern aggregation");
                    }
                }
            }
            sort_history_by_timestamp_if_present(&mut history);
            history.truncate(opts.history_length);
        }

        Ok((snapshot, history))
    }

    async fn subscribe(self: &Arc<Self>) -> Result<()> {
        let rx = if self.name.is_pattern() {
            self.store.pubsub.subscribe_pattern(&self.keys.channel).await?
        } else {
            self.store.pubsub.subscribe_literal(&self.keys.channel).await?
        };
        let room = self.clone();
        let handle = tokio::spawn(room.run_message_loop(rx));
        *self.message_task.lock().await = Some(handle);
        Ok(())
    }

    async fn run_message_loop(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<String>) {
        while let Some(raw) = rx.recv().await {
            self.handle_message(&raw).await;
        }
    }

    /// Merge an incoming message into the snapshot/history, then dispatch to
    /// every registered callback. Malformed messages are logged and dropped.
    async fn handle_message(&self, raw: &str) {
        let incoming: Payload = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(room = %self.name, error = %e, "dropping malformed pubsub message");
                return;
            }
        };

        let opts = self.options.read().await.clone();
        if opts.enable_full_data {
            let mut snapshot = self.snapshot.write().await;
            payload::merge_into(&mut snapshot, &incoming);
        }
        if opts.history_length > 0 {
            let mut history = self.history.write().await;
            history.insert(0, incoming.clone());
            history.truncate(opts.history_length);
        }

        let snapshot_copy = payload::deep_copy(&*self.snapshot.read().await);
        self.dispatch(&snapshot_copy, Some(&incoming));
    }

    fn dispatch(&self, snapshot: &Payload, new_data: Option<&Payload>) {
        for entry in self.callbacks.iter() {
            let user_id = entry.key().clone();
            let cb = entry.value().callback.clone();
            let extra = entry.value().extra_data.clone();
            self.invoke_callback(&user_id, &cb, snapshot, new_data, extra.as_ref());
        }
    }

    fn invoke_callback(
        &self,
        user_id: &str,
        callback: &Callback,
        snapshot: &Payload,
        new_data: Option<&Payload>,
        extra_data: Option<&Value>,
    ) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(snapshot, new_data, extra_data);
        }));
        if result.is_err() {
            error!(room = %self.name, user_id = %user_id, "callback panicked, skipping");
        }
    }
}

fn decode_history(raw: Vec<String>, cap: usize) -> Vec<Payload> {
    let mut decoded = Vec::with_capacity(raw.len().min(cap));
    for item in raw {
        match serde_json::from_str::<Payload>(&item) {
            Ok(v) => decoded.push(v),
            Err(e) => warn!(error = %e, "dropping malformed history entry"),
        }
        if decoded.len() >= cap {
            break;
        }
    }
    decoded
}

/// Sort descending by `timestamp` only if the *first* element carries one.
/// This mirrors an intentional (if surprising) upstream heuristic: mixed
/// payloads where only later elements carry a timestamp are left unsorted.
fn sort_history_by_timestamp_if_present(history: &mut [Payload]) {
    let first_has_timestamp = history.first().is_some_and(|p| p.contains_key("timestamp"));
    if !first_has_timestamp {
        return;
    }
    history.sort_by(|a, b| {
        let ta = a.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        let tb = b.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
    });
}
