//! Distributed room-state synchronization core.
//!
//! A small set of abstractions -- rooms, producers, consumers, and pattern
//! subscriptions -- that let processes in a cluster share a named unit of
//! state and a stream of updates through a Redis-compatible store.
//!
//! [`RoomManager`] creates and looks up [`Room`] instances, hosts the
//! stateless [`RoomManager::publish`], and runs the idle reaper.
//! [`RoomService`] is a thin producer/consumer-intent facade over it.

pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod payload;
pub mod room;
pub mod service;
pub mod singleflight;
pub mod store;

pub use config::RoomManagerConfig;
pub use error::{Error, Result};
pub use keys::{KeyTriple, RoomName};
pub use manager::RoomManager;
pub use payload::Payload;
pub use room::{Callback, Room, RoomOptions, RoomOptionsOverride};
pub use service::RoomService;
pub use store::{CommandStore, FakeStore, PubSub, RedisCommandStore, RedisPubSubHub, StoreClientPair};
