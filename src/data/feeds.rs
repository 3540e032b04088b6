//! Feed engine collaborator
//!
//! The feed engine owns followed feeds and stores ingested items.
//! The federation core only talks to it through these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FollowedFeed, IncomingFeedItem, RemoteActor};
use crate::error::AppError;

/// Lookup and bookkeeping for followed feeds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedRepository: Send + Sync {
    /// Find a followed feed by its URL
    async fn find_by_url(&self, url: &str) -> Result<Option<FollowedFeed>, AppError>;

    /// All feeds handled by a parser
    async fn feeds_by_parser(&self, parser: &str) -> Result<Vec<FollowedFeed>, AppError>;

    /// Replace the feed's last log message
    async fn update_last_log(&self, url: &str, message: &str) -> Result<(), AppError>;

    /// Stop pull-polling a push-driven feed
    async fn disable_polling(&self, url: &str) -> Result<(), AppError>;

    /// Attach resolved actor metadata to the feed
    async fn store_metadata(&self, url: &str, actor: &RemoteActor) -> Result<(), AppError>;
}

/// Receiver of converted feed items
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedIngest: Send + Sync {
    async fn ingest(&self, items: Vec<IncomingFeedItem>, feed: &FollowedFeed)
    -> Result<(), AppError>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Feed repository kept in process memory
///
/// Used by the binary (seeded from configuration) and by tests.
/// Every write takes the lock for the whole update, so a last-log
/// message is never observed half written.
#[derive(Default)]
pub struct InMemoryFeeds {
    feeds: RwLock<HashMap<String, FollowedFeed>>,
    items: RwLock<Vec<(String, IncomingFeedItem)>>,
}

impl InMemoryFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a feed
    pub async fn upsert(&self, feed: FollowedFeed) {
        self.feeds.write().await.insert(feed.url.clone(), feed);
    }

    /// Remove a feed
    pub async fn remove(&self, url: &str) -> Option<FollowedFeed> {
        self.feeds.write().await.remove(url)
    }

    /// Current state of a feed
    pub async fn get(&self, url: &str) -> Option<FollowedFeed> {
        self.feeds.read().await.get(url).cloned()
    }

    /// Items ingested so far, with the URL of the feed they were ingested for
    pub async fn ingested(&self) -> Vec<(String, IncomingFeedItem)> {
        self.items.read().await.clone()
    }
}

#[async_trait]
impl FeedRepository for InMemoryFeeds {
    async fn find_by_url(&self, url: &str) -> Result<Option<FollowedFeed>, AppError> {
        let feeds = self.feeds.read().await;
        if let Some(feed) = feeds.get(url) {
            return Ok(Some(feed.clone()));
        }

        // Feeds are often stored with or without a trailing slash.
        let trimmed = url.trim_end_matches('/');
        Ok(feeds
            .values()
            .find(|feed| feed.url.trim_end_matches('/') == trimmed)
            .cloned())
    }

    async fn feeds_by_parser(&self, parser: &str) -> Result<Vec<FollowedFeed>, AppError> {
        let mut feeds: Vec<FollowedFeed> = self
            .feeds
            .read()
            .await
            .values()
            .filter(|feed| feed.parser == parser)
            .cloned()
            .collect();
        feeds.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(feeds)
    }

    async fn update_last_log(&self, url: &str, message: &str) -> Result<(), AppError> {
        let mut feeds = self.feeds.write().await;
        let feed = feeds.get_mut(url).ok_or(AppError::NotFound)?;
        feed.last_log = Some(message.to_string());
        Ok(())
    }

    async fn disable_polling(&self, url: &str) -> Result<(), AppError> {
        let mut feeds = self.feeds.write().await;
        let feed = feeds.get_mut(url).ok_or(AppError::NotFound)?;
        feed.polling_disabled = true;
        Ok(())
    }

    async fn store_metadata(&self, url: &str, actor: &RemoteActor) -> Result<(), AppError> {
        let mut feeds = self.feeds.write().await;
        let feed = feeds.get_mut(url).ok_or(AppError::NotFound)?;
        feed.metadata = Some(actor.clone());
        Ok(())
    }
}

#[async_trait]
impl FeedIngest for InMemoryFeeds {
    async fn ingest(
        &self,
        items: Vec<IncomingFeedItem>,
        feed: &FollowedFeed,
    ) -> Result<(), AppError> {
        let mut stored = self.items.write().await;
        for item in items {
            // The external id is the deduplication key of the feed engine.
            if stored
                .iter()
                .any(|(url, existing)| url == &feed.url && existing.external_id == item.external_id)
            {
                tracing::debug!(external_id = %item.external_id, "Skipping already ingested item");
                continue;
            }
            stored.push((feed.url.clone(), item));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ItemMetadata, PostStatus};
    use chrono::Utc;

    fn item(external_id: &str) -> IncomingFeedItem {
        IncomingFeedItem {
            permalink: external_id.to_string(),
            content: "hello".to_string(),
            author: None,
            published_at: Utc::now(),
            external_id: external_id.to_string(),
            post_format: "status".to_string(),
            status: PostStatus::Publish,
            metadata: ItemMetadata::default(),
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn find_by_url_ignores_trailing_slash() {
        let feeds = InMemoryFeeds::new();
        feeds
            .upsert(FollowedFeed::activitypub("https://remote.example/users/alice/", "alice"))
            .await;

        let found = feeds
            .find_by_url("https://remote.example/users/alice")
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(feeds.find_by_url("https://remote.example/users/bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_last_log_replaces_message() {
        let feeds = InMemoryFeeds::new();
        feeds
            .upsert(FollowedFeed::activitypub("https://remote.example/users/alice", "alice"))
            .await;

        feeds
            .update_last_log("https://remote.example/users/alice", "first")
            .await
            .unwrap();
        feeds
            .update_last_log("https://remote.example/users/alice", "second")
            .await
            .unwrap();

        let feed = feeds.get("https://remote.example/users/alice").await.unwrap();
        assert_eq!(feed.last_log.as_deref(), Some("second"));
        assert!(matches!(
            feeds.update_last_log("https://unknown.example", "x").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ingest_skips_duplicate_external_ids() {
        let feeds = InMemoryFeeds::new();
        let feed = FollowedFeed::activitypub("https://remote.example/users/alice", "alice");
        feeds.upsert(feed.clone()).await;

        feeds.ingest(vec![item("https://remote.example/notes/1")], &feed).await.unwrap();
        feeds
            .ingest(
                vec![item("https://remote.example/notes/1"), item("https://remote.example/notes/2")],
                &feed,
            )
            .await
            .unwrap();

        assert_eq!(feeds.ingested().await.len(), 2);
    }
}
