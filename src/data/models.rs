//! Data models
//!
//! Rust structs for the values that cross the federation core:
//! resolved remote actors, followed feeds owned by the feed engine,
//! and the feed items produced from inbound activities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parser slug used by feeds that are driven by ActivityPub
pub const ACTIVITYPUB_PARSER: &str = "activitypub";

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Remote Actor
// =============================================================================

/// Profile metadata of a remote actor
///
/// Built from an actor document fetched through the federation
/// transport, or synthesized for placeholder domains.
/// Fields the core does not consume are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteActor {
    pub id: Option<String>,
    /// Profile page URL (Mastodon: https://host/@name)
    pub url: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub icon_url: Option<String>,
    /// Icon object type as sent by the remote (usually "Image")
    pub icon_type: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteActor {
    /// Parse an ActivityStreams actor document
    ///
    /// Accepts `url` and `icon` either as plain strings, link objects,
    /// or arrays of those (first usable entry wins).
    pub fn from_document(document: &serde_json::Value) -> Option<Self> {
        let object = document.as_object()?;

        let text = |key: &str| {
            object
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let icon = object.get("icon").and_then(first_entry);
        let icon_url = icon.and_then(link_href);
        let icon_type = icon
            .and_then(|icon| icon.get("type"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| icon_url.as_ref().map(|_| "Image".to_string()));

        let shared_inbox = object
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        const CONSUMED: [&str; 10] = [
            "id",
            "url",
            "inbox",
            "outbox",
            "preferredUsername",
            "name",
            "icon",
            "summary",
            "endpoints",
            "@context",
        ];
        let extra = object
            .iter()
            .filter(|(key, _)| !CONSUMED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Some(Self {
            id: text("id"),
            url: object
                .get("url")
                .and_then(first_entry)
                .and_then(link_href),
            inbox: text("inbox"),
            shared_inbox,
            outbox: text("outbox"),
            preferred_username: text("preferredUsername"),
            name: text("name"),
            icon_url,
            icon_type,
            summary: text("summary"),
            extra,
        })
    }

    /// Minimal actor used for documentation placeholder domains
    pub fn placeholder(domain: &str, username: &str) -> Self {
        Self {
            id: None,
            url: Some(format!("https://{}/users/{}/", domain, username)),
            inbox: None,
            shared_inbox: None,
            outbox: None,
            preferred_username: None,
            name: Some(username.to_string()),
            icon_url: None,
            icon_type: None,
            summary: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The URL that identifies this actor (id, falling back to url)
    pub fn canonical_url(&self) -> Option<&str> {
        self.id.as_deref().or(self.url.as_deref())
    }

    /// Display name preferring `name` over `preferredUsername`
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.preferred_username.as_deref())
    }
}

fn first_entry(value: &serde_json::Value) -> Option<&serde_json::Value> {
    match value {
        serde_json::Value::Array(entries) => entries.iter().find(|entry| link_href(entry).is_some()),
        serde_json::Value::Null => None,
        other => Some(other),
    }
}

/// Extract an href from a string, `Link` or `Image` object
pub fn link_href(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(href) if !href.trim().is_empty() => Some(href.trim().to_string()),
        serde_json::Value::Object(object) => object
            .get("href")
            .or_else(|| object.get("url"))
            .and_then(link_href),
        _ => None,
    }
}

// =============================================================================
// Followed Feed (owned by the feed engine)
// =============================================================================

/// A feed followed by a local friend user
///
/// The federation core reads these and only writes the last log
/// message, the polling switch and the actor metadata blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowedFeed {
    pub url: String,
    /// Parser slug, `activitypub` for feeds handled here
    pub parser: String,
    /// Login of the local friend user that owns the feed
    pub friend_login: String,
    /// Show replies that mention actors we do not follow
    pub show_replies: bool,
    pub last_log: Option<String>,
    pub polling_disabled: bool,
    pub metadata: Option<RemoteActor>,
}

impl FollowedFeed {
    /// New ActivityPub feed for a friend user
    pub fn activitypub(url: impl Into<String>, friend_login: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parser: ACTIVITYPUB_PARSER.to_string(),
            friend_login: friend_login.into(),
            show_replies: false,
            last_log: None,
            polling_disabled: false,
            metadata: None,
        }
    }

    pub fn is_activitypub(&self) -> bool {
        self.parser == ACTIVITYPUB_PARSER
    }
}

// =============================================================================
// Incoming Feed Item
// =============================================================================

/// Post status the ingestion layer should apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    #[default]
    Publish,
    /// Filtered by a feed rule, kept out of the timeline
    Trash,
}

/// Author details attached from the `attributedTo` actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributedTo {
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&RemoteActor> for AttributedTo {
    fn from(actor: &RemoteActor) -> Self {
        Self {
            id: actor.canonical_url().map(str::to_string),
            icon: actor.icon_url.clone(),
            summary: actor.summary.clone(),
            preferred_username: actor.preferred_username.clone(),
            name: actor.name.clone(),
        }
    }
}

/// ActivityPub side-channel metadata stored with a feed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub reblog: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<AttributedTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<serde_json::Value>,
}

/// Feed item produced from an inbound activity
///
/// `external_id` is always the object's `id`, the deduplication key of
/// the ingestion layer. `permalink` prefers the object's `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingFeedItem {
    pub permalink: String,
    pub content: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub external_id: String,
    pub post_format: String,
    pub status: PostStatus,
    pub metadata: ItemMetadata,
    /// The raw object the item was converted from
    pub raw: serde_json::Value,
}

// =============================================================================
// Local posts and feed details
// =============================================================================

/// A post in the local feed reader that the user reacts to or reblogs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPost {
    /// Permalink the post was imported with
    pub guid: String,
    /// Remote object id, when the item carried one
    pub external_id: Option<String>,
    /// Parser of the feed the post came from
    pub parser: String,
    /// Login of the friend user that authored the post
    pub author_login: String,
}

impl LocalPost {
    /// Remote object to like or unlike
    pub fn object_id(&self) -> &str {
        self.external_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.guid)
    }
}

/// Feed details shown when subscribing
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FeedDetails {
    pub url: String,
    pub title: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
    /// Poll interval the feed engine should use; a year for push feeds
    pub poll_interval_secs: Option<u64>,
}

/// A feed found at a URL during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredFeed {
    pub url: String,
    pub mime_type: String,
    pub rel: String,
    pub post_format: String,
    pub parser: String,
    pub autoselect: bool,
}
