//! In-memory caches
//!
//! These caches are volatile and cleared on restart.
//! Uses Moka for high-performance concurrent caching.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::RemoteActor;

// =============================================================================
// Actor Cache
// =============================================================================

/// Resolved remote actors, keyed by the handle or URL they were resolved from
///
/// Failed resolutions are never stored, so a transport error is retried
/// on the next lookup. Re-resolving a key replaces the entry.
pub struct ActorCache {
    actors: Cache<String, Arc<RemoteActor>>,
}

impl ActorCache {
    /// Create new actor cache
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of actors to keep
    /// * `ttl` - How long a resolved actor stays valid
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let actors = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { actors }
    }

    /// Get actor by lookup key
    pub async fn get(&self, key: &str) -> Option<Arc<RemoteActor>> {
        let result = self.actors.get(key).await;

        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
        if result.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&["actor"]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&["actor"]).inc();
        }

        result
    }

    /// Insert or replace an actor
    pub async fn insert(&self, key: &str, actor: Arc<RemoteActor>) {
        self.actors.insert(key.to_string(), actor).await;
    }

    /// Drop a single entry
    pub async fn invalidate(&self, key: &str) {
        self.actors.invalidate(key).await;
        tracing::debug!(key, "Invalidated actor cache entry");
    }
}

// =============================================================================
// Seen Activities
// =============================================================================

/// Ids of inbound activities that were already processed
///
/// Guards the feed engine against a remote server redelivering the
/// same activity.
pub struct SeenActivities {
    ids: Cache<String, ()>,
}

impl SeenActivities {
    pub fn new(ttl: Duration) -> Self {
        let ids = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl)
            .build();

        Self { ids }
    }

    /// Record an activity id
    ///
    /// Returns `false` if the id was already recorded.
    pub async fn first_sighting(&self, id: &str) -> bool {
        let entry = self.ids.entry(id.to_string()).or_insert(()).await;
        entry.is_fresh()
    }

    /// Forget an id so the activity can be processed again
    pub async fn forget(&self, id: &str) {
        self.ids.invalidate(id).await;
    }
}
