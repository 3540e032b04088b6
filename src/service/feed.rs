//! Feed service
//!
//! Discovery, subscription details and outbox previews for feeds
//! backed by an ActivityPub actor.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::data::{
    ACTIVITYPUB_PARSER, DiscoveredFeed, FeedDetails, FeedRepository, IncomingFeedItem, RemoteActor,
};
use crate::error::AppError;
use crate::federation::{ActivityProcessor, ActorResolver};

/// Poll interval handed to the feed engine for push-driven feeds
pub const PUSH_FEED_POLL_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

const ACTIVITY_JSON: &str = "application/activity+json";

lazy_static! {
    static ref HANDLE: Regex = Regex::new(r"(?i)^@?[^@]+@((?:[a-z0-9-]+\.)+[a-z]+)$")
        .expect("handle pattern is valid");
    static ref USERS_URL: Regex =
        Regex::new(r"^https?://([^/]+)/users/([^/]+)").expect("users url pattern is valid");
}

/// How confident we are that a URL is an ActivityPub feed (0 or 10)
pub fn support_confidence(url: &str, mime_type: &str) -> u8 {
    if HANDLE.is_match(url) || mime_type == ACTIVITY_JSON {
        10
    } else {
        0
    }
}

/// Login suggestion for a `https://host/users/name` actor URL
///
/// Returns `name-host`.
pub fn suggest_user_login(url: &str) -> Option<String> {
    USERS_URL
        .captures(url)
        .map(|caps| format!("{}-{}", &caps[2], &caps[1]))
}

/// Feed service
pub struct FeedService {
    resolver: Arc<ActorResolver>,
    processor: Arc<ActivityProcessor>,
    feeds: Arc<dyn FeedRepository>,
}

impl FeedService {
    pub fn new(
        resolver: Arc<ActorResolver>,
        processor: Arc<ActivityProcessor>,
        feeds: Arc<dyn FeedRepository>,
    ) -> Self {
        Self {
            resolver,
            processor,
            feeds,
        }
    }

    /// Fill subscription details from the actor behind `details.url`
    ///
    /// Details are returned unchanged when the actor cannot be resolved.
    pub async fn feed_details(&self, details: FeedDetails) -> FeedDetails {
        let actor = match self.resolver.resolve(&details.url).await {
            Ok(actor) => actor,
            Err(e) => {
                tracing::debug!(url = %details.url, error = %e, "No actor behind feed");
                return details;
            }
        };

        let is_image_icon = actor
            .icon_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("image"));

        FeedDetails {
            url: actor.id.clone().unwrap_or(details.url),
            title: actor.display_name().map(str::to_string).or(details.title),
            avatar: if is_image_icon {
                actor.icon_url.clone().or(details.avatar)
            } else {
                details.avatar
            },
            description: actor.summary.clone().or(details.description),
            poll_interval_secs: Some(PUSH_FEED_POLL_INTERVAL_SECS),
        }
    }

    /// Feeds offered for a URL or handle
    pub async fn discover_feeds(&self, url: &str) -> Vec<DiscoveredFeed> {
        let actor = match self.resolver.resolve(url).await {
            Ok(actor) => actor,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Nothing to discover");
                return Vec::new();
            }
        };

        let Some(id) = actor.canonical_url() else {
            return Vec::new();
        };

        vec![DiscoveredFeed {
            url: id.to_string(),
            mime_type: ACTIVITY_JSON.to_string(),
            rel: "self".to_string(),
            post_format: "status".to_string(),
            parser: ACTIVITYPUB_PARSER.to_string(),
            autoselect: true,
        }]
    }

    /// Resolve the actor of a followed feed and attach it to the feed
    pub async fn refresh_metadata(&self, feed_url: &str) -> Result<Arc<RemoteActor>, AppError> {
        self.resolver.invalidate(feed_url).await;
        let actor = self.resolver.resolve(feed_url).await?;
        self.feeds.store_metadata(feed_url, &actor).await?;
        Ok(actor)
    }

    /// A followed feed became active; it is push-driven from now on
    pub async fn activate(&self, feed_url: &str) -> Result<(), AppError> {
        let feed = self.feeds.find_by_url(feed_url).await?.ok_or(AppError::NotFound)?;
        if !feed.is_activitypub() {
            return Ok(());
        }

        self.feeds.disable_polling(&feed.url).await?;
        if let Err(e) = self.refresh_metadata(&feed.url).await {
            tracing::warn!(feed = %feed.url, error = %e, "Failed to store actor metadata");
        }
        tracing::info!(feed = %feed.url, "Activated push feed");
        Ok(())
    }

    /// Preview the latest posts of an actor
    pub async fn fetch_outbox(
        &self,
        url: &str,
        feed_url: Option<&str>,
    ) -> Result<Vec<IncomingFeedItem>, AppError> {
        let feed = match feed_url {
            Some(feed_url) => Some(
                self.feeds
                    .find_by_url(feed_url)
                    .await?
                    .ok_or(AppError::NotFound)?,
            ),
            None => None,
        };

        self.processor.fetch_outbox(url, feed.as_ref()).await
    }
}
