//! Friends Federation - ActivityPub core of a followed-feeds reader
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes (personal and shared)                            │
//! │  - Health, metrics                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Feed discovery, details, outbox preview                  │
//! │  - Follow / like / reblog actions                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation Layer                           │
//! │  - Actor resolver, activity builder                         │
//! │  - Delivery queue and workers                               │
//! │  - Inbound processor, mention rewriter                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Feed repository / ingestion traits                       │
//! │  - Moka caches                                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for inboxes and metrics
//! - `service`: Operations invoked by the host
//! - `federation`: ActivityPub federation handling
//! - `data`: Models, feed collaborator traits and caches
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use data::{ActorCache, FeedRepository, FollowedFeed, InMemoryFeeds, SeenActivities};
use federation::{
    ActivityDelivery, ActivityProcessor, ActorResolver, DeliveryQueue, FederationTransport,
    MentionRewriter, MentionTable,
};

/// Application state shared across all handlers
///
/// Cloned for each request; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Followed feeds and ingested items
    pub feeds: Arc<InMemoryFeeds>,

    /// Actor resolver with its cache
    pub resolver: Arc<ActorResolver>,

    /// Inbound activity processor
    pub processor: Arc<ActivityProcessor>,

    /// Mention linking for local content
    pub mentions: Arc<MentionRewriter>,

    /// Feed discovery and previews
    pub feed_service: Arc<service::FeedService>,

    /// Outbound actions
    pub outbound: Arc<service::OutboundService>,

    delivery: ActivityDelivery,
}

impl AppState {
    /// Wire the federation core
    ///
    /// # Arguments
    /// * `config` - Loaded configuration
    /// * `transport` - Network capability used for every remote call
    /// * `feeds` - Feed collaborator
    pub fn new(
        config: config::AppConfig,
        transport: Arc<dyn FederationTransport>,
        feeds: Arc<InMemoryFeeds>,
    ) -> Self {
        let deadline = config.federation.request_timeout();

        let resolver = Arc::new(ActorResolver::new(
            transport.clone(),
            ActorCache::new(
                config.cache.actor_max_entries,
                Duration::from_secs(config.cache.actor_ttl_secs),
            ),
            deadline,
        ));

        let mention_table = Arc::new(MentionTable::new(feeds.clone(), config.cache.cache_mentions));

        let processor = Arc::new(
            ActivityProcessor::new(
                transport.clone(),
                resolver.clone(),
                feeds.clone(),
                feeds.clone(),
                mention_table.clone(),
                deadline,
                &config.federation.main_user,
            )
            .with_seen_activities(SeenActivities::new(Duration::from_secs(
                config.cache.seen_activity_ttl_secs,
            ))),
        );

        let delivery = ActivityDelivery::new(
            transport,
            resolver.clone(),
            feeds.clone(),
            &config.server.base_url(),
            deadline,
            config.federation.max_concurrent_deliveries,
        );

        let outbound = Arc::new(service::OutboundService::new(
            Arc::new(DeliveryQueue::new()),
            delivery.clone(),
            feeds.clone(),
        ));

        let feed_service = Arc::new(service::FeedService::new(
            resolver.clone(),
            processor.clone(),
            feeds.clone(),
        ));

        Self {
            config: Arc::new(config),
            feeds,
            mentions: Arc::new(MentionRewriter::new(mention_table, resolver.clone())),
            resolver,
            processor,
            feed_service,
            outbound,
            delivery,
        }
    }

    /// Add the feeds declared in configuration
    pub async fn seed_feeds(&self) {
        for seed in &self.config.feeds {
            let mut feed = FollowedFeed::activitypub(seed.url.clone(), seed.friend_login.clone());
            feed.show_replies = seed.show_replies;
            self.feeds.upsert(feed).await;
        }
        self.invalidate_mentions().await;

        tracing::info!(feeds = self.config.feeds.len(), "Seeded followed feeds");
    }

    /// Start the workers that drain the delivery queue
    pub fn spawn_delivery_workers(&self) -> Vec<JoinHandle<()>> {
        let workers = self.config.federation.delivery_workers;
        tracing::info!(workers, "Starting delivery workers");
        self.outbound
            .queue()
            .spawn_workers(Arc::new(self.delivery.clone()), workers)
    }

    /// Drop the memoised mention table; call after followed feeds change
    pub async fn invalidate_mentions(&self) {
        self.mentions.table().invalidate().await;
    }

    /// Known mentions in a piece of content, keyed by `@slug`
    pub async fn extract_mentions(
        &self,
        content: &str,
    ) -> error::Result<std::collections::BTreeMap<String, String>> {
        federation::extract_mentions(self.mentions.table(), content).await
    }

    /// Followed feed for a URL
    pub async fn feed(&self, url: &str) -> error::Result<Option<FollowedFeed>> {
        self.feeds.find_by_url(url).await
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::inbox_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
