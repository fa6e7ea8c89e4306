//! Service Facade (C5): the surface a hosting process talks to.
//!
//! Thin wrapper over [`RoomManager`]: `createRoom` forces `enablePublish:
//! true` onto caller options (producer intent is implicit in calling
//! `createRoom` at all); `getRoom` and `publish` forward unchanged.

use crate::error::Result;
use crate::manager::RoomManager;
use crate::payload::Payload;
use crate::room::{Room, RoomOptions};
use std::sync::Arc;

/// Facade over a [`RoomManager`] enforcing producer/consumer intent at the
/// call site rather than leaving `enable_publish` to the caller's discretion.
pub struct RoomService {
    manager: Arc<RoomManager>,
}

impl RoomService {
    #[must_use]
    pub fn new(manager: Arc<RoomManager>) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    /// Producer intent: always creates (or upgrades) a producer room,
    /// regardless of `opts.enable_publish`.
    pub async fn create_room(&self, name: &str, opts: RoomOptions) -> Result<Arc<Room>> {
        let opts = RoomOptions {
            enable_publish: true,
            ..opts
        };
        self.manager.create_room(name, opts).await
    }

    /// Consumer intent: forwarded unchanged.
    pub async fn get_room(&self, name: &str, opts: RoomOptions) -> Result<Arc<Room>> {
        self.manager.get_room(name, opts).await
    }

    /// Forwarded unchanged.
    pub async fn publish(&self, name: &str, data: Payload, opts: Option<RoomOptions>) -> Result<()> {
        self.manager.publish(name, data, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomManagerConfig;
    use crate::store::{FakeStore, StoreClientPair};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn test_create_room_always_forces_enable_publish() {
        let fake = FakeStore::new();
        let store = StoreClientPair::new(StdArc::new(fake.clone()), StdArc::new(fake));
        let manager = Arc::new(RoomManager::with_store(RoomManagerConfig::default(), store));
        let service = RoomService::new(manager);

        let room = service
            .create_room("r", RoomOptions { enable_publish: false, ..Default::default() })
            .await
            .unwrap();
        // forced true regardless of the caller's opts
        room.publish(Payload::new(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_room_rejects_pattern_even_through_facade() {
        let fake = FakeStore::new();
        let store = StoreClientPair::new(StdArc::new(fake.clone()), StdArc::new(fake));
        let manager = Arc::new(RoomManager::with_store(RoomManagerConfig::default(), store));
        let service = RoomService::new(manager);

        let err = service.create_room("x*", RoomOptions::default()).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::PatternNotAllowedForProducer(_)));
    }
}
