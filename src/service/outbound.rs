//! Outbound service
//!
//! Turns local user actions into queued delivery jobs and runs the
//! reblog fan-out.

use std::sync::Arc;

use crate::data::{ACTIVITYPUB_PARSER, FeedRepository, FollowedFeed, LocalPost};
use crate::error::AppError;
use crate::federation::{
    ActivityDelivery, DeliveryJob, DeliveryQueue, DeliveryResult, EnqueueOutcome, Verb,
};

/// Outbound service
pub struct OutboundService {
    queue: Arc<DeliveryQueue>,
    delivery: ActivityDelivery,
    feeds: Arc<dyn FeedRepository>,
}

impl OutboundService {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        delivery: ActivityDelivery,
        feeds: Arc<dyn FeedRepository>,
    ) -> Self {
        Self {
            queue,
            delivery,
            feeds,
        }
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    // =========================================================================
    // Follow / Unfollow
    // =========================================================================

    /// Queue a follow of a feed's actor
    pub async fn queue_follow(
        &self,
        feed_url: &str,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.activitypub_feed(feed_url).await?;
        self.schedule(&feed, DeliveryJob::follow(&feed.url, acting_user))
            .await
    }

    /// Queue an unfollow of a feed's actor
    pub async fn queue_unfollow(
        &self,
        feed_url: &str,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.activitypub_feed(feed_url).await?;
        self.schedule(&feed, DeliveryJob::unfollow(&feed.url, acting_user))
            .await
    }

    // =========================================================================
    // Like / Unlike
    // =========================================================================

    /// Queue a like of a remote object
    pub async fn queue_like(
        &self,
        feed_url: &str,
        object: &str,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.activitypub_feed(feed_url).await?;
        self.schedule(&feed, DeliveryJob::like(&feed.url, object, acting_user))
            .await
    }

    /// Queue an unlike of a remote object
    pub async fn queue_unlike(
        &self,
        feed_url: &str,
        object: &str,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.activitypub_feed(feed_url).await?;
        self.schedule(&feed, DeliveryJob::unlike(&feed.url, object, acting_user))
            .await
    }

    /// React to a post in the reader; queues a like on the post's feed
    ///
    /// # Errors
    /// `NotFound` when no ActivityPub feed of the author matches the post
    pub async fn react(
        &self,
        post: &LocalPost,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.feed_for_post(post).await?.ok_or(AppError::NotFound)?;
        self.schedule(
            &feed,
            DeliveryJob::like(&feed.url, post.object_id(), acting_user),
        )
        .await
    }

    /// Remove a reaction; queues an unlike on the post's feed
    pub async fn unreact(
        &self,
        post: &LocalPost,
        acting_user: &str,
    ) -> Result<EnqueueOutcome, AppError> {
        let feed = self.feed_for_post(post).await?.ok_or(AppError::NotFound)?;
        self.schedule(
            &feed,
            DeliveryJob::unlike(&feed.url, post.object_id(), acting_user),
        )
        .await
    }

    /// The ActivityPub feed of the post's author on the post's host
    pub async fn feed_for_post(&self, post: &LocalPost) -> Result<Option<FollowedFeed>, AppError> {
        let Some(host) = host_of(&post.guid) else {
            return Ok(None);
        };

        let feeds = self.feeds.feeds_by_parser(ACTIVITYPUB_PARSER).await?;
        Ok(feeds.into_iter().find(|feed| {
            feed.friend_login == post.author_login
                && host_of(&feed.url).as_deref() == Some(host.as_str())
        }))
    }

    // =========================================================================
    // Reblog
    // =========================================================================

    /// Announce a post to the acting user's followers
    ///
    /// Returns `None` for posts that did not come from an ActivityPub feed;
    /// those are reblogged by other means. Each per-inbox attempt is
    /// written to the log of the post's feed.
    pub async fn reblog(&self, post: &LocalPost, acting_user: &str) -> Option<Vec<DeliveryResult>> {
        if post.parser != ACTIVITYPUB_PARSER {
            return None;
        }

        let feed = match self.feed_for_post(post).await {
            Ok(feed) => feed,
            Err(e) => {
                tracing::warn!(post = %post.guid, error = %e, "Failed to look up feed for reblog");
                None
            }
        };
        if feed.is_none() {
            tracing::debug!(post = %post.guid, "Reblogging post without a followed feed");
        }

        Some(
            self.delivery
                .announce(&post.guid, acting_user, feed.as_ref().map(|feed| feed.url.as_str()))
                .await,
        )
    }

    async fn activitypub_feed(&self, feed_url: &str) -> Result<FollowedFeed, AppError> {
        let feed = self
            .feeds
            .find_by_url(feed_url)
            .await?
            .ok_or(AppError::NotFound)?;
        if !feed.is_activitypub() {
            return Err(AppError::Validation(format!(
                "{} is not an ActivityPub feed",
                feed.url
            )));
        }
        Ok(feed)
    }

    /// Queue a job and note it in the feed log
    ///
    /// The log line is written while the job is reserved but not yet
    /// dispatched, so a worker's outcome line always lands after it.
    async fn schedule(
        &self,
        feed: &FollowedFeed,
        job: DeliveryJob,
    ) -> Result<EnqueueOutcome, AppError> {
        let Some(reservation) = self.queue.reserve(job).await? else {
            return Ok(EnqueueOutcome::AlreadyPending);
        };

        let verb = reservation.job().verb;
        if let Err(e) = self
            .feeds
            .update_last_log(&feed.url, &queued_message(verb))
            .await
        {
            tracing::warn!(feed = %feed.url, error = %e, "Failed to update feed log");
        }

        self.queue.dispatch(reservation).await?;
        tracing::info!(feed = %feed.url, verb = %verb, "Queued job");

        Ok(EnqueueOutcome::Queued)
    }
}

fn queued_message(verb: Verb) -> String {
    format!("Queued {} request.", verb)
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}
