//! Inbound ActivityStreams wire types
//!
//! Only the fields the core consumes are typed; everything else is kept
//! in `extra` so nothing is lost on the way to the feed engine.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::data::link_href;

/// Activity types the processor acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundType {
    Create,
    Announce,
    /// Anything else, kept with its original spelling
    Other(String),
}

impl InboundType {
    /// Parse a type name, ignoring case
    pub fn parse(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "create" => Self::Create,
            "announce" => Self::Announce,
            _ => Self::Other(kind.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Announce => "announce",
            Self::Other(kind) => kind,
        }
    }
}

/// An activity received in an inbox or read from an outbox
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundActivity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Actor URL, or an actor object carrying an `id`
    #[serde(default, deserialize_with = "id_or_object")]
    pub actor: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundActivity {
    pub fn inbound_type(&self) -> InboundType {
        InboundType::parse(&self.kind)
    }

    /// The embedded object of a Create
    pub fn note(&self) -> Result<Note, String> {
        let object = self
            .object
            .as_ref()
            .filter(|object| object.is_object())
            .ok_or_else(|| "create without an embedded object".to_string())?;
        Note::from_value(object.clone())
    }

    /// The URL an Announce points at
    ///
    /// Servers also send the announced object embedded; its `id` is used then.
    pub fn announced_url(&self) -> Option<String> {
        match self.object.as_ref()? {
            Value::String(url) => Some(url.clone()),
            Value::Object(object) => object.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }
}

/// A post object (Note, Article, Page, ...)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub url: Option<Value>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default, deserialize_with = "id_or_object")]
    pub attributed_to: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub attachment: Vec<Attachment>,
    #[serde(default)]
    pub application: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Note {
    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| format!("invalid object: {}", e))
    }

    /// Human-facing URL, falling back to the id
    pub fn permalink(&self) -> String {
        self.url
            .as_ref()
            .and_then(|url| match url {
                Value::Array(entries) => entries.iter().find_map(link_href),
                other => link_href(other),
            })
            .unwrap_or_else(|| self.id.clone())
    }
}

/// A media attachment
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub url: Option<Value>,
    /// Kept as sent; remotes disagree on integer, float or string
    #[serde(default)]
    pub width: Option<Value>,
    #[serde(default)]
    pub height: Option<Value>,
}

impl Attachment {
    /// Image documents are embedded into the item content
    pub fn is_image(&self) -> bool {
        self.kind.as_deref() == Some("Document")
            && self
                .media_type
                .as_deref()
                .is_some_and(|media_type| media_type.starts_with("image/"))
    }

    pub fn href(&self) -> Option<String> {
        match self.url.as_ref()? {
            Value::Array(entries) => entries.iter().find_map(link_href),
            other => link_href(other),
        }
    }

    pub fn width(&self) -> String {
        dimension(self.width.as_ref())
    }

    pub fn height(&self) -> String {
        dimension(self.height.as_ref())
    }
}

fn dimension(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

/// An outbox collection page
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionPage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub ordered_items: Vec<Value>,
}

fn id_or_object<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(object)) => object.get("id").and_then(Value::as_str).map(str::to_string),
        Some(Value::Array(entries)) => entries.into_iter().find_map(|entry| match entry {
            Value::String(id) => Some(id),
            Value::Object(object) => object.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }),
        _ => None,
    })
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Attachment>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(entries)) => entries.into_iter().filter_map(attachment).collect(),
        Some(entry @ Value::Object(_)) => attachment(entry).into_iter().collect(),
        _ => Vec::new(),
    })
}

fn attachment(entry: Value) -> Option<Attachment> {
    match serde_json::from_value(entry) {
        Ok(attachment) => Some(attachment),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unreadable attachment");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_type_ignores_case() {
        assert_eq!(InboundType::parse("Create"), InboundType::Create);
        assert_eq!(InboundType::parse("announce"), InboundType::Announce);
        assert_eq!(InboundType::parse("Follow"), InboundType::Other("Follow".to_string()));
    }

    #[test]
    fn activity_keeps_unknown_fields() {
        let activity: InboundActivity = serde_json::from_value(json!({
            "id": "https://social.example/activities/1",
            "type": "Create",
            "actor": { "id": "https://social.example/users/bob", "type": "Person" },
            "object": { "id": "https://social.example/notes/1", "content": "hi" },
            "signature": { "type": "RsaSignature2017" }
        }))
        .unwrap();

        assert_eq!(activity.actor.as_deref(), Some("https://social.example/users/bob"));
        assert!(activity.extra.contains_key("signature"));
        assert_eq!(activity.note().unwrap().id, "https://social.example/notes/1");
    }

    #[test]
    fn note_accepts_single_attachment_and_link_url() {
        let note = Note::from_value(json!({
            "id": "https://social.example/notes/1",
            "url": { "type": "Link", "href": "https://social.example/@bob/1" },
            "attributedTo": [{ "id": "https://social.example/users/bob" }],
            "attachment": { "type": "Document", "mediaType": "image/jpeg", "url": "https://files.example/1.jpg" }
        }))
        .unwrap();

        assert_eq!(note.permalink(), "https://social.example/@bob/1");
        assert_eq!(note.attributed_to.as_deref(), Some("https://social.example/users/bob"));
        assert_eq!(note.attachment.len(), 1);
        assert!(note.attachment[0].is_image());
    }

    #[test]
    fn attachment_dimensions_are_read_as_sent() {
        let note = Note::from_value(json!({
            "id": "https://social.example/notes/2",
            "attachment": [
                { "type": "Document", "mediaType": "image/png", "url": "https://files.example/1.png", "width": 640.0, "height": "480" },
                { "type": "Document", "mediaType": "image/png", "url": "https://files.example/2.png", "width": 800, "height": null }
            ]
        }))
        .unwrap();

        assert_eq!(note.attachment.len(), 2);
        assert!(note.attachment.iter().all(Attachment::is_image));
        assert_eq!(note.attachment[0].width(), "640.0");
        assert_eq!(note.attachment[0].height(), "480");
        assert_eq!(note.attachment[1].width(), "800");
        assert_eq!(note.attachment[1].height(), "");
    }

    #[test]
    fn note_without_id_is_invalid() {
        assert!(Note::from_value(json!({ "content": "orphan" })).is_err());
    }

    #[test]
    fn announced_url_reads_string_or_embedded_id() {
        let activity: InboundActivity = serde_json::from_value(json!({
            "type": "Announce",
            "actor": "https://social.example/users/bob",
            "object": "https://other.example/notes/9"
        }))
        .unwrap();
        assert_eq!(activity.announced_url().as_deref(), Some("https://other.example/notes/9"));

        let activity: InboundActivity = serde_json::from_value(json!({
            "type": "Announce",
            "object": { "id": "https://other.example/notes/10" }
        }))
        .unwrap();
        assert_eq!(activity.announced_url().as_deref(), Some("https://other.example/notes/10"));
        assert!(activity.actor.is_none());
    }
}
