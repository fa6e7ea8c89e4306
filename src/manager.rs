//! Room Manager (C4): creates/looks up Room instances, hosts the stateless
//! `publish`, runs the periodic idle reaper, owns the store client pair.
//!
//! The reaper is grounded on
//! `synctv-cluster::sync::connection_manager::ConnectionManager::spawn_cleanup_task`:
//! a `tokio::spawn`ed loop driven by `tokio::time::interval`, cancelled via a
//! `tokio_util::sync::CancellationToken` rather than by dropping the handle.

use crate::config::RoomManagerConfig;
use crate::error::Result;
use crate::keys::{key_triple, KeyTriple, RoomName};
use crate::payload::{self, Payload};
use crate::room::{Room, RoomOptions};
use crate::store::{CommandStore, PubSub, RedisCommandStore, RedisPubSubHub, StoreClientPair};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Creates, looks up, and reaps [`Room`] instances for one process.
pub struct RoomManager {
    rooms: Arc<DashMap<RoomName, Arc<Room>>>,
    store: StoreClientPair,
    config: RoomManagerConfig,
    reaper: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl RoomManager {
    /// Connect to Redis using `config.redis_url` for both the command and
    /// subscribe connections.
    pub fn new(config: RoomManagerConfig) -> Result<Self> {
        let command: Arc<dyn CommandStore> = Arc::new(RedisCommandStore::new(&config.redis_url)?);
        let pubsub: Arc<dyn PubSub> = Arc::new(RedisPubSubHub::start(
            &config.redis_url,
            &config.prefix,
            config.subscriber_channel_capacity,
        )?);
        Ok(Self::with_store(config, StoreClientPair::new(command, pubsub)))
    }

    /// Build a manager around an already-constructed store pair (a
    /// [`crate::store::FakeStore`] in tests).
    #[must_use]
    pub fn with_store(config: RoomManagerConfig, store: StoreClientPair) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            store,
            config,
            reaper: Mutex::new(None),
        }
    }

    /// `createRoom(name, opts)`.
    pub async fn create_room(&self, name: &str, opts: RoomOptions) -> Result<Arc<Room>> {
        let room_name = RoomName::new(name)?;
        if room_name.is_pattern() && opts.enable_publish {
            return Err(crate::error::Error::PatternNotAllowedForProducer(name.to_string()));
        }

        // `entry` holds the shard lock across the get-or-create, so two
        // concurrent `create_room` calls for the same fresh name can't both
        // win the "doesn't exist yet" race and construct two Rooms.
        let want_publish = opts.enable_publish;
        let room = self
            .rooms
            .entry(room_name.clone())
            .or_insert_with(|| {
                let keys = key_triple(&self.config.prefix, room_name.as_str());
                Room::new(room_name.clone(), keys, opts, self.store.clone())
            })
            .value()
            .clone();
        if want_publish {
            room.upgrade_to_producer().await;
        }
        Ok(room)
    }

    /// `getRoom(name, opts)`.
    pub async fn get_room(&self, name: &str, opts: RoomOptions) -> Result<Arc<Room>> {
        let room_name = RoomName::new(name)?;
        if let Some(existing) = self.rooms.get(&room_name).map(|r| r.value().clone()) {
            return Ok(existing);
        }
        self.create_room(name, opts).await
    }

    /// `publish(name, data, opts)` -- stateless producer path. Does not
    /// require (or create) a local Room; any Room instance subscribed to
    /// `name` picks the update up through its own subscription.
    pub async fn publish(&self, name: &str, data: Payload, opts: Option<RoomOptions>) -> Result<()> {
        let room_name = RoomName::new(name)?;
        let keys = key_triple(&self.config.prefix, room_name.as_str());
        let effective = opts.unwrap_or_default();
        publish_stateless(&self.store, &keys, &data, &effective).await
    }

    /// Connect both clients (already connected lazily by `new`) and schedule
    /// the idle reaper.
    pub async fn start(&self) {
        let mut guard = self.reaper.lock().await;
        if guard.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let rooms = self.rooms.clone();
        let idle_timeout = self.config.idle_timeout;
        let check_interval = self.config.check_interval;
        let reaper_cancel = cancel.clone();
        let handle = tokio::spawn(run_reaper(rooms, idle_timeout, check_interval, reaper_cancel));
        *guard = Some((handle, cancel));
        info!("room manager started");
    }

    /// Cancel the reaper, destroy every Room (triggering unsubscribe), and
    /// drop the store client pair. Best-effort: errors during teardown are
    /// logged, not propagated.
    pub async fn stop(&self) {
        if let Some((handle, cancel)) = self.reaper.lock().await.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "reaper task join error during stop");
            }
        }

        let names: Vec<RoomName> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, room)) = self.rooms.remove(&name) {
                room.destroy().await;
            }
        }
        info!("room manager stopped");
    }
}

async fn run_reaper(
    rooms: Arc<DashMap<RoomName, Arc<Room>>>,
    idle_timeout: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(check_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => reap_once(&rooms, idle_timeout).await,
        }
    }
}

async fn reap_once(rooms: &DashMap<RoomName, Arc<Room>>, idle_timeout: Duration) {
    let now = Utc::now();
    let mut reap_list = Vec::new();
    for entry in rooms.iter() {
        if entry.value().is_reapable(idle_timeout, now).await {
            reap_list.push(entry.key().clone());
        }
    }
    for name in reap_list {
        if let Some((_, room)) = rooms.remove(&name) {
            room.destroy().await;
            info!(room = %name, "reaped idle room");
        }
    }
}

/// `Manager.publish`'s storage half, shared between [`RoomManager::publish`]
/// and [`Room::publish`] (a producer Room delegates here after its own
/// `NotAProducer`/`cleanOnStartUp` checks). `data`'s `Payload` type already
/// guarantees a non-null JSON object, so the *InvalidPublishPayload* check
/// the source performs at runtime is enforced here by the type system
/// instead.
pub(crate) async fn publish_stateless(
    store: &StoreClientPair,
    keys: &KeyTriple,
    data: &Payload,
    opts: &RoomOptions,
) -> Result<()> {
    let hash_fut = async {
        if opts.enable_full_data {
            let fields = payload::encode_for_hash(data);
            if !fields.is_empty() {
                store.command.hset(&keys.hash, &fields).await?;
            }
        }
        Ok::<(), crate::error::Error>(())
    };
    let history_fut = async {
        if opts.history_length > 0 {
            let encoded = serde_json::to_string(data)?;
            store.command.lpush_trim(&keys.list, &encoded, opts.history_length).await?;
        }
        Ok::<(), crate::error::Error>(())
    };
    let publish_fut = async {
        let encoded = serde_json::to_string(data)?;
        store.command.publish(&keys.channel, &encoded).await?;
        Ok::<(), crate::error::Error>(())
    };

    let (hash_result, history_result, publish_result) = tokio::join!(hash_fut, history_fut, publish_fut);
    hash_result?;
    history_result?;
    publish_result?;
    Ok(())
}
