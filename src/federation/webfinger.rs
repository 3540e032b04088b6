//! WebFinger handles
//!
//! Normalizes `user@domain` handles and URLs, and reads the actor URI
//! out of a WebFinger JRD document.

use serde::{Deserialize, Serialize};

/// An account handle (`user@domain`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub username: String,
    pub domain: String,
}

impl Handle {
    /// WebFinger resource for this handle
    pub fn resource(&self) -> String {
        format!("acct:{}@{}", self.username, self.domain)
    }

    /// WebFinger lookup URL on the handle's domain
    pub fn webfinger_url(&self) -> String {
        format!(
            "https://{}/.well-known/webfinger?resource={}",
            self.domain,
            urlencoding::encode(&self.resource())
        )
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username, self.domain)
    }
}

/// What a user typed to identify an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRef {
    Handle(Handle),
    Url(String),
}

impl ActorRef {
    /// Normalize a handle or URL
    ///
    /// A leading `http://` or `https://` is ignored when deciding the form,
    /// so a handle that was turned into a URL by mistake is still a handle.
    /// Input containing `@` and no `/` is a handle; anything else is a URL.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let without_scheme = strip_http_scheme(input);
        if without_scheme.contains('@') && !without_scheme.contains('/') {
            let without_acct = without_scheme
                .strip_prefix("acct:")
                .unwrap_or(without_scheme);
            let (username, domain) = without_acct.trim_start_matches('@').split_once('@')?;
            if username.is_empty() || domain.is_empty() {
                return None;
            }

            return Some(Self::Handle(Handle {
                username: username.to_string(),
                domain: domain.to_ascii_lowercase(),
            }));
        }

        Some(Self::Url(input.to_string()))
    }

    /// Username and domain, as far as they can be read from the input
    ///
    /// URLs yield the host and the last non-empty path segment
    /// (with a leading `@` removed).
    pub fn username_and_domain(&self) -> Option<(String, String)> {
        match self {
            Self::Handle(handle) => Some((handle.username.clone(), handle.domain.clone())),
            Self::Url(raw) => {
                let parsed = url::Url::parse(raw).ok()?;
                let domain = parsed.host_str()?.to_ascii_lowercase();
                let username = parsed
                    .path_segments()?
                    .filter(|segment| !segment.is_empty())
                    .last()?
                    .trim_start_matches('@')
                    .to_string();
                Some((username, domain))
            }
        }
    }
}

impl std::fmt::Display for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handle(handle) => handle.fmt(f),
            Self::Url(url) => f.write_str(url),
        }
    }
}

fn strip_http_scheme(input: &str) -> &str {
    input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
        .unwrap_or(input)
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// ActivityPub actor URI from the `self` link
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|link| link.rel == "self")
            .find(|link| {
                link.link_type.as_deref().is_some_and(|kind| {
                    kind == "application/activity+json" || kind.starts_with("application/ld+json")
                })
            })
            .and_then(|link| link.href.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_handle_forms() {
        for input in [
            "alice@mastodon.example",
            "@alice@mastodon.example",
            "acct:alice@mastodon.example",
            "https://alice@Mastodon.Example",
        ] {
            assert_eq!(
                ActorRef::parse(input),
                Some(ActorRef::Handle(Handle {
                    username: "alice".to_string(),
                    domain: "mastodon.example".to_string(),
                })),
                "input: {}",
                input
            );
        }
    }

    #[test]
    fn parse_treats_paths_as_urls() {
        assert_eq!(
            ActorRef::parse("https://mastodon.example/@alice"),
            Some(ActorRef::Url("https://mastodon.example/@alice".to_string()))
        );
        assert_eq!(ActorRef::parse("  "), None);
        assert_eq!(ActorRef::parse("@mastodon.example"), None);
    }

    #[test]
    fn username_and_domain_reads_url_paths() {
        let actor = ActorRef::parse("https://Social.Example/users/bob/").unwrap();
        assert_eq!(
            actor.username_and_domain(),
            Some(("bob".to_string(), "social.example".to_string()))
        );

        let actor = ActorRef::parse("https://social.example/@carol").unwrap();
        assert_eq!(
            actor.username_and_domain(),
            Some(("carol".to_string(), "social.example".to_string()))
        );
    }

    #[test]
    fn webfinger_url_encodes_resource() {
        let handle = Handle {
            username: "alice".to_string(),
            domain: "mastodon.example".to_string(),
        };
        assert_eq!(
            handle.webfinger_url(),
            "https://mastodon.example/.well-known/webfinger?resource=acct%3Aalice%40mastodon.example"
        );
    }

    #[test]
    fn actor_uri_picks_activity_json_self_link() {
        let jrd: WebFingerResponse = serde_json::from_value(serde_json::json!({
            "subject": "acct:alice@mastodon.example",
            "links": [
                { "rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://mastodon.example/@alice" },
                { "rel": "self", "type": "application/activity+json", "href": "https://mastodon.example/users/alice" }
            ]
        }))
        .unwrap();

        assert_eq!(jrd.actor_uri(), Some("https://mastodon.example/users/alice"));
    }
}
