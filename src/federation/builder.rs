//! Outbound activity construction
//!
//! Activity ids are derived from `(actor, verb, target)` only, so
//! rebuilding the same logical action yields the same id and a remote
//! server can drop the repeat as a duplicate.

use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;

const ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";

/// Local action that produces an outbound activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Follow,
    Unfollow,
    Like,
    Unlike,
    Announce,
}

impl Verb {
    /// Name used in the activity id fragment and in log messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Follow => "follow",
            Verb::Unfollow => "unfollow",
            Verb::Like => "like",
            Verb::Unlike => "unlike",
            Verb::Announce => "announce",
        }
    }

    /// ActivityStreams type on the wire
    pub fn activity_type(&self) -> ActivityType {
        match self {
            Verb::Follow => ActivityType::Follow,
            Verb::Like => ActivityType::Like,
            Verb::Announce => ActivityType::Announce,
            Verb::Unfollow | Verb::Unlike => ActivityType::Undo,
        }
    }

    /// The verb an Undo reverts
    pub fn undoes(&self) -> Option<Verb> {
        match self {
            Verb::Unfollow => Some(Verb::Follow),
            Verb::Unlike => Some(Verb::Like),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound ActivityStreams types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityType {
    Follow,
    Undo,
    Like,
    Announce,
}

/// Remove the `scheme://` prefix of a URL
pub fn strip_scheme(url: &str) -> &str {
    match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    }
}

/// Deterministic activity id: `actor#verb-target` with the target's scheme removed
pub fn activity_id(actor: &str, verb: Verb, target: &str) -> String {
    format!("{}#{}-{}", actor, verb.as_str(), strip_scheme(target))
}

/// The activity an Undo reverts, rebuilt from the same id rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddedActivity {
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub actor: String,
    pub object: String,
    pub id: String,
}

/// `object` of an outbound activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ActivityObject {
    Url(String),
    Embedded(EmbeddedActivity),
}

impl ActivityObject {
    pub fn as_url(&self) -> Option<&str> {
        match self {
            ActivityObject::Url(url) => Some(url),
            ActivityObject::Embedded(_) => None,
        }
    }
}

/// Activity ready for delivery
///
/// `to` and `cc` serialize as `null` when unset; only Announce
/// carries recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundActivity {
    #[serde(rename = "@context")]
    pub context: &'static str,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub actor: String,
    pub object: ActivityObject,
    pub to: Option<Vec<String>>,
    pub cc: Option<Vec<String>>,
    pub id: String,
}

impl OutboundActivity {
    /// Set the `to` recipients
    pub fn with_recipients(mut self, to: Vec<String>) -> Self {
        self.to = Some(to);
        self
    }

    /// Embedded activity shape of this activity, as an Undo would carry it
    pub fn as_embedded(&self) -> Option<EmbeddedActivity> {
        Some(EmbeddedActivity {
            kind: self.kind,
            actor: self.actor.clone(),
            object: self.object.as_url()?.to_string(),
            id: self.id.clone(),
        })
    }

    pub fn to_json(&self) -> Result<Value, AppError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Build an outbound activity
///
/// # Arguments
/// * `verb` - Local action
/// * `actor` - Local actor URL
/// * `target` - Followed actor, liked object or announced object
/// * `object_override` - Wire object to send instead of `target`; the id
///   still derives from `target`
pub fn build(
    verb: Verb,
    actor: &str,
    target: &str,
    object_override: Option<&str>,
) -> OutboundActivity {
    let object_url = object_override.unwrap_or(target).to_string();

    let object = match verb.undoes() {
        Some(original) => ActivityObject::Embedded(EmbeddedActivity {
            kind: original.activity_type(),
            actor: actor.to_string(),
            object: object_url,
            id: activity_id(actor, original, target),
        }),
        None => ActivityObject::Url(object_url),
    };

    OutboundActivity {
        context: ACTIVITY_STREAMS,
        kind: verb.activity_type(),
        actor: actor.to_string(),
        object,
        to: None,
        cc: None,
        id: activity_id(actor, verb, target),
    }
}

/// Build an Announce of `object` addressed to `to`
pub fn announce(actor: &str, object: &str, to: Vec<String>) -> OutboundActivity {
    build(Verb::Announce, actor, object, None).with_recipients(to)
}
