//! Activity processing
//!
//! Turns inbound Create and Announce activities from followed actors
//! into feed items and hands them to the feed engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::actor::ActorResolver;
use super::mention::MentionTable;
use super::object::{CollectionPage, InboundActivity, InboundType, Note};
use super::transport::{FederationTransport, with_deadline};
use crate::data::{
    AttributedTo, FeedIngest, FeedRepository, FollowedFeed, IncomingFeedItem, ItemMetadata,
    PostStatus, SeenActivities,
};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED, INBOUND_OUTCOMES};

lazy_static! {
    static ref LEADING_MENTION: Regex =
        Regex::new(r"(?i)^@[a-z0-9_.-]+").expect("leading mention pattern is valid");
}

const POST_FORMAT: &str = "status";

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

fn strip_tags(content: &str) -> String {
    ammonia::Builder::empty().clean(content).to_string()
}

/// Block-formatted image embed appended for an image attachment
fn image_block(src: &str, width: &str, height: &str) -> String {
    format!(
        "\n<!-- wp:image --><p><img src=\"{}\" width=\"{}\"  height=\"{}\" class=\"size-full\" /></p><!-- /wp:image -->",
        html_escape::encode_double_quoted_attribute(src),
        html_escape::encode_double_quoted_attribute(width),
        html_escape::encode_double_quoted_attribute(height)
    )
}

/// Why an inbound activity was not handed off
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Activity type this processor does not handle
    Unsupported(String),
    /// Actor does not match a followed feed
    NotFollowed(String),
    /// Malformed payload
    Invalid(String),
    /// Fetching the announced object or actor failed
    Transport(String),
    /// Activity id was already processed
    Duplicate(String),
    /// The feed engine refused the item
    IngestFailed(String),
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Unsupported(_) => "unsupported",
            RejectReason::NotFollowed(_) => "not_followed",
            RejectReason::Invalid(_) => "invalid",
            RejectReason::Transport(_) => "transport",
            RejectReason::Duplicate(_) => "duplicate",
            RejectReason::IngestFailed(_) => "ingest_failed",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            RejectReason::Unsupported(detail)
            | RejectReason::NotFollowed(detail)
            | RejectReason::Invalid(detail)
            | RejectReason::Transport(detail)
            | RejectReason::Duplicate(detail)
            | RejectReason::IngestFailed(detail) => detail,
        }
    }
}

impl From<AppError> for RejectReason {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Transport(e) => RejectReason::Transport(e.to_string()),
            AppError::NotFollowed(actor) => RejectReason::NotFollowed(actor),
            other => RejectReason::Invalid(other.to_string()),
        }
    }
}

/// Final state of an inbound activity
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    HandedOff(Box<IncomingFeedItem>),
    Rejected(RejectReason),
}

impl InboundOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            InboundOutcome::HandedOff(_) => "handed_off",
            InboundOutcome::Rejected(reason) => reason.label(),
        }
    }
}

/// Activity processor
///
/// Processes incoming ActivityPub activities from the inbox.
pub struct ActivityProcessor {
    transport: Arc<dyn FederationTransport>,
    resolver: Arc<ActorResolver>,
    feeds: Arc<dyn FeedRepository>,
    ingest: Arc<dyn FeedIngest>,
    mentions: Arc<MentionTable>,
    seen: Option<SeenActivities>,
    deadline: Duration,
    /// Local user that fetches announced objects when no user is given
    main_user: String,
}

impl ActivityProcessor {
    /// Create new activity processor
    pub fn new(
        transport: Arc<dyn FederationTransport>,
        resolver: Arc<ActorResolver>,
        feeds: Arc<dyn FeedRepository>,
        ingest: Arc<dyn FeedIngest>,
        mentions: Arc<MentionTable>,
        deadline: Duration,
        main_user: &str,
    ) -> Self {
        Self {
            transport,
            resolver,
            feeds,
            ingest,
            mentions,
            seen: None,
            deadline,
            main_user: main_user.to_string(),
        }
    }

    /// Reject activities whose id was already processed
    pub fn with_seen_activities(mut self, seen: SeenActivities) -> Self {
        self.seen = Some(seen);
        self
    }

    /// Process an incoming activity
    ///
    /// # Arguments
    /// * `activity` - Raw JSON-LD activity
    /// * `acting_user` - Local user whose inbox received it, if any
    ///
    /// # Returns
    /// `HandedOff` with the item given to the feed engine, or `Rejected`.
    /// Rejection is an expected outcome, never an error.
    pub async fn process(&self, activity: Value, acting_user: Option<&str>) -> InboundOutcome {
        let outcome = self.process_inner(activity, acting_user).await;
        INBOUND_OUTCOMES.with_label_values(&[outcome.label()]).inc();

        match &outcome {
            InboundOutcome::HandedOff(item) => {
                tracing::info!(external_id = %item.external_id, "Handed off feed item");
            }
            InboundOutcome::Rejected(reason) => {
                tracing::debug!(reason = reason.label(), detail = reason.detail(), "Rejected activity");
            }
        }
        outcome
    }

    async fn process_inner(&self, raw: Value, acting_user: Option<&str>) -> InboundOutcome {
        // 1. Parse activity envelope
        let activity: InboundActivity = match serde_json::from_value(raw) {
            Ok(activity) => activity,
            Err(e) => return InboundOutcome::Rejected(RejectReason::Invalid(e.to_string())),
        };

        let inbound_type = activity.inbound_type();
        let type_label = inbound_type.as_str().to_ascii_lowercase();
        ACTIVITIES_RECEIVED.with_label_values(&[type_label.as_str()]).inc();

        if let InboundType::Other(kind) = inbound_type {
            return InboundOutcome::Rejected(RejectReason::Unsupported(kind));
        }

        let Some(actor) = activity.actor.clone() else {
            return InboundOutcome::Rejected(RejectReason::Invalid("missing actor".to_string()));
        };

        // 2. Validate the actor against followed feeds
        let feed = match self.match_feed(&actor).await {
            Ok(feed) => feed,
            Err(reason) => return InboundOutcome::Rejected(reason),
        };

        // 3. Guard against redelivery
        if let (Some(seen), Some(id)) = (&self.seen, &activity.id) {
            if !seen.first_sighting(id).await {
                return InboundOutcome::Rejected(RejectReason::Duplicate(id.clone()));
            }
        }

        // 4. Convert and hand off
        let result = self.hand_off(&activity, &feed, acting_user).await;
        if let (Err(_), Some(seen), Some(id)) = (&result, &self.seen, &activity.id) {
            seen.forget(id).await;
        }

        match result {
            Ok(item) => InboundOutcome::HandedOff(Box::new(item)),
            Err(reason) => InboundOutcome::Rejected(reason),
        }
    }

    async fn hand_off(
        &self,
        activity: &InboundActivity,
        feed: &FollowedFeed,
        acting_user: Option<&str>,
    ) -> Result<IncomingFeedItem, RejectReason> {
        let mut item = self
            .convert(activity, acting_user)
            .await?
            .ok_or_else(|| RejectReason::Unsupported(activity.kind.clone()))?;

        self.apply_feed_rules(&mut item, feed).await;

        if !feed.polling_disabled {
            if let Err(e) = self.feeds.disable_polling(&feed.url).await {
                tracing::warn!(feed = %feed.url, error = %e, "Failed to disable polling");
            }
        }

        self.ingest
            .ingest(vec![item.clone()], feed)
            .await
            .map_err(|e| RejectReason::IngestFailed(e.to_string()))?;

        Ok(item)
    }

    /// Find the followed feed for an actor
    ///
    /// Tries the literal actor URL first, then the resolved actor's id and url.
    async fn match_feed(&self, actor: &str) -> Result<FollowedFeed, RejectReason> {
        if url::Url::parse(actor).is_ok() {
            if let Some(feed) = self.feeds.find_by_url(actor).await.map_err(RejectReason::from)? {
                return Ok(feed);
            }
        }

        let resolved = match self.resolver.resolve(actor).await {
            Ok(resolved) => resolved,
            Err(AppError::Transport(e)) => return Err(RejectReason::Transport(e.to_string())),
            Err(e) => {
                tracing::debug!(actor = %actor, error = %e, "Received invalid meta");
                return Err(RejectReason::NotFollowed(actor.to_string()));
            }
        };

        for candidate in [resolved.id.as_deref(), resolved.url.as_deref()]
            .into_iter()
            .flatten()
            .filter(|candidate| *candidate != actor)
        {
            if let Some(feed) = self
                .feeds
                .find_by_url(candidate)
                .await
                .map_err(RejectReason::from)?
            {
                return Ok(feed);
            }
        }

        tracing::info!(actor = %actor, "We're not following this actor");
        Err(RejectReason::NotFollowed(actor.to_string()))
    }

    /// Convert a create or announce into a feed item
    ///
    /// Returns `None` for other activity types.
    async fn convert(
        &self,
        activity: &InboundActivity,
        acting_user: Option<&str>,
    ) -> Result<Option<IncomingFeedItem>, RejectReason> {
        match activity.inbound_type() {
            InboundType::Create => {
                let note = activity.note().map_err(RejectReason::Invalid)?;
                let raw = activity.object.clone().unwrap_or(Value::Null);
                Ok(Some(self.convert_note(note, raw, false).await))
            }
            InboundType::Announce => {
                let url = activity
                    .announced_url()
                    .filter(|url| url::Url::parse(url).is_ok())
                    .ok_or_else(|| RejectReason::Invalid("invalid announce".to_string()))?;
                let user = acting_user.unwrap_or(&self.main_user);
                let (note, raw) = self.fetch_note(&url, user).await?;
                Ok(Some(self.convert_note(note, raw, true).await))
            }
            InboundType::Other(_) => Ok(None),
        }
    }

    /// Dereference an announced object
    async fn fetch_note(&self, url: &str, acting_user: &str) -> Result<(Note, Value), RejectReason> {
        tracing::debug!(url = %url, "Received announce");
        let raw = with_deadline(self.deadline, self.transport.dereference(url, acting_user))
            .await
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|e| RejectReason::Transport(e.to_string()))?;

        let note = Note::from_value(raw.clone()).map_err(RejectReason::Invalid)?;
        Ok((note, raw))
    }

    async fn convert_note(&self, note: Note, raw: Value, reblog: bool) -> IncomingFeedItem {
        let mut content = sanitize_remote_html(note.content.as_deref().unwrap_or_default());
        for attachment in note.attachment.iter().filter(|a| a.is_image()) {
            if let Some(src) = attachment.href() {
                content.push_str(&image_block(&src, &attachment.width(), &attachment.height()));
            }
        }

        let published_at = note
            .published
            .as_deref()
            .and_then(|published| DateTime::parse_from_rfc3339(published).ok())
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut metadata = ItemMetadata {
            reblog,
            attributed_to: None,
            application: note.application.clone().filter(|app| !app.is_null()),
        };

        let mut author = None;
        if let Some(attributed_to) = &note.attributed_to {
            match self.resolver.resolve(attributed_to).await {
                Ok(actor) => {
                    author = actor.display_name().map(str::to_string);
                    metadata.attributed_to = Some(AttributedTo::from(actor.as_ref()));
                }
                Err(e) => {
                    tracing::debug!(actor = %attributed_to, error = %e, "Attribution lookup failed");
                }
            }
        }

        IncomingFeedItem {
            permalink: note.permalink(),
            content,
            author,
            published_at,
            external_id: note.id,
            post_format: POST_FORMAT.to_string(),
            status: PostStatus::Publish,
            metadata,
            raw,
        }
    }

    /// Hide replies to people the user does not follow, unless the feed opts in
    async fn apply_feed_rules(&self, item: &mut IncomingFeedItem, feed: &FollowedFeed) {
        if feed.show_replies || !feed.is_activitypub() {
            return;
        }

        let plain_text = strip_tags(&item.content);
        let Some(mention) = LEADING_MENTION.find(plain_text.trim_start()) else {
            return;
        };

        match self.mentions.get().await {
            Ok(known) if known.contains_key(mention.as_str()) => {}
            Ok(_) => {
                tracing::debug!(mention = %mention.as_str(), "Trashing reply to unknown actor");
                item.status = PostStatus::Trash;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load mention table"),
        }
    }

    /// Read the first page of an actor's outbox as feed items
    ///
    /// Used to preview a feed before subscribing. Polling of `feed` is
    /// disabled since the feed is push-driven.
    ///
    /// # Errors
    /// - `InvalidActivity` when the actor has no outbox or the page is not
    ///   an `OrderedCollectionPage`
    /// - `Transport` when a fetch fails
    pub async fn fetch_outbox(
        &self,
        url: &str,
        feed: Option<&FollowedFeed>,
    ) -> Result<Vec<IncomingFeedItem>, AppError> {
        if let Some(feed) = feed {
            self.feeds.disable_polling(&feed.url).await?;
        }

        let actor = self.resolver.resolve(url).await?;
        let outbox_url = actor
            .outbox
            .clone()
            .ok_or_else(|| AppError::InvalidActivity(format!("{} has no outbox", url)))?;

        let outbox = self.fetch_json(&outbox_url).await?;
        let page = match outbox.get("first") {
            Some(Value::String(first)) => self.fetch_json(first).await?,
            Some(first @ Value::Object(_)) => first.clone(),
            _ => {
                return Err(AppError::InvalidActivity(format!(
                    "outbox {} has no first page",
                    outbox_url
                )));
            }
        };

        let page: CollectionPage = serde_json::from_value(page)?;
        if page.kind.as_deref() != Some("OrderedCollectionPage") {
            return Err(AppError::InvalidActivity(format!(
                "outbox page has type {:?}",
                page.kind
            )));
        }

        let mut items = Vec::new();
        for entry in page.ordered_items {
            let activity: InboundActivity = match serde_json::from_value(entry) {
                Ok(activity) => activity,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed outbox entry");
                    continue;
                }
            };
            match self.convert(&activity, None).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(reason) => {
                    tracing::debug!(reason = reason.label(), detail = reason.detail(), "Skipping outbox entry");
                }
            }
        }

        Ok(items)
    }

    async fn fetch_json(&self, url: &str) -> Result<Value, AppError> {
        let response = with_deadline(self.deadline, self.transport.dereference(url, &self.main_user))
            .await?
            .error_for_status()?;
        Ok(response.json()?)
    }
}
