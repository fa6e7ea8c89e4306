//! Single-flight guard for lazy Room initialization.
//!
//! Adapted from `synctv-core::cache::singleflight`: wraps `async_singleflight`
//! so that concurrent first-use callers on a fresh [`crate::room::Room`] share
//! one fetch+subscribe instead of each racing to initialize independently.
//! `async_singleflight::Group` removes a key's in-flight entry once it
//! completes, success or failure, which is exactly the retry-on-failure
//! behavior the initialization protocol needs: a failed attempt clears the
//! guard so the next caller tries again from scratch.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Error type for [`SingleFlight`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SingleFlightError<E> {
    /// The leader task panicked or was dropped before completing.
    #[error("singleflight worker failed - leader dropped or panicked")]
    WorkerFailed,
    /// The underlying operation returned an error.
    #[error("{0}")]
    Inner(E),
}

/// Deduplicates concurrent executions of the same keyed async operation.
#[derive(Clone)]
pub struct SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    group: Arc<async_singleflight::Group<K, V, E>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            group: Arc::new(async_singleflight::Group::new()),
        }
    }

    /// Run `f` for `key` if no other call for `key` is in flight; otherwise
    /// await that call's result. The key's entry is removed once `f`
    /// completes (success or failure), so a failed attempt does not poison
    /// later calls for the same key.
    pub async fn do_work<Fut>(&self, key: K, f: Fut) -> Result<V, SingleFlightError<E>>
    where
        Fut: std::future::Future<Output = Result<V, E>> + Send,
    {
        self.group.work(&key, f).await.map_err(|opt_err| match opt_err {
            Some(inner) => SingleFlightError::Inner(inner),
            None => SingleFlightError::WorkerFailed,
        })
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
