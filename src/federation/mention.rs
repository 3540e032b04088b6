//! Mentions of followed actors
//!
//! `@slug` tokens in local content are linked to the followed actor the
//! slug belongs to. The slug is the normalized login of the local friend
//! user that owns an ActivityPub feed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tokio::sync::RwLock;

use super::actor::ActorResolver;
use crate::data::{ACTIVITYPUB_PARSER, FeedRepository};
use crate::error::AppError;

lazy_static! {
    static ref MENTION: Regex = Regex::new(r"@[a-zA-Z0-9_-]+").expect("mention pattern is valid");
    static ref ANCHOR: Regex =
        Regex::new(r"(?i)<a.*?href=[^>]+>.*?</a>").expect("anchor pattern is valid");
    static ref PLACEHOLDER: Regex =
        Regex::new(r"!#!#PROTECT(\d+)#!#!").expect("placeholder pattern is valid");
}

/// Normalize a login into a mention slug
///
/// Lowercases, turns whitespace and dots into dashes, drops anything
/// else outside `[a-z0-9_-]` and collapses repeated dashes.
pub fn mention_slug(login: &str) -> String {
    let mut slug = String::with_capacity(login.len());
    for c in login.trim().chars().flat_map(char::to_lowercase) {
        let c = if c.is_whitespace() || c == '.' { '-' } else { c };
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            continue;
        }
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    slug.trim_matches('-').to_string()
}

// =============================================================================
// Lookup table
// =============================================================================

/// `@slug` to feed URL for every followed ActivityPub feed
///
/// Built from the feed repository. When caching is enabled the table is
/// kept until `invalidate` is called; otherwise it is rebuilt on every use.
pub struct MentionTable {
    feeds: Arc<dyn FeedRepository>,
    cache_enabled: bool,
    cached: RwLock<Option<Arc<HashMap<String, String>>>>,
}

impl MentionTable {
    pub fn new(feeds: Arc<dyn FeedRepository>, cache_enabled: bool) -> Self {
        Self {
            feeds,
            cache_enabled,
            cached: RwLock::new(None),
        }
    }

    /// Current table
    pub async fn get(&self) -> Result<Arc<HashMap<String, String>>, AppError> {
        if self.cache_enabled {
            if let Some(table) = self.cached.read().await.as_ref() {
                return Ok(table.clone());
            }
        }

        let table = Arc::new(self.build().await?);
        if self.cache_enabled {
            *self.cached.write().await = Some(table.clone());
        }
        Ok(table)
    }

    /// Drop the memoised table; call when followed feeds change
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        tracing::debug!("Mention table invalidated");
    }

    async fn build(&self) -> Result<HashMap<String, String>, AppError> {
        let feeds = self.feeds.feeds_by_parser(ACTIVITYPUB_PARSER).await?;
        let table: HashMap<String, String> = feeds
            .into_iter()
            .filter_map(|feed| {
                let slug = mention_slug(&feed.friend_login);
                (!slug.is_empty()).then(|| (format!("@{}", slug), feed.url))
            })
            .collect();

        tracing::debug!(entries = table.len(), "Built mention table");
        Ok(table)
    }
}

/// Known mentions in a piece of content, keyed by `@slug`
pub async fn extract_mentions(
    table: &MentionTable,
    content: &str,
) -> Result<BTreeMap<String, String>, AppError> {
    let known = table.get().await?;
    Ok(MENTION
        .find_iter(content)
        .filter_map(|token| {
            known
                .get(token.as_str())
                .map(|url| (token.as_str().to_string(), url.clone()))
        })
        .collect())
}

// =============================================================================
// Rewriter
// =============================================================================

/// Links `@slug` mentions to followed actors
pub struct MentionRewriter {
    table: Arc<MentionTable>,
    resolver: Arc<ActorResolver>,
}

impl MentionRewriter {
    pub fn new(table: Arc<MentionTable>, resolver: Arc<ActorResolver>) -> Self {
        Self { table, resolver }
    }

    pub fn table(&self) -> &Arc<MentionTable> {
        &self.table
    }

    /// Rewrite known mentions into mention links
    ///
    /// Existing anchors are left untouched. Tokens without a known feed,
    /// or whose actor cannot be resolved, stay as they are.
    pub async fn rewrite(&self, content: &str) -> String {
        let known = match self.table.get().await {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load mention table");
                return content.to_string();
            }
        };
        if known.is_empty() {
            return content.to_string();
        }

        let (protected, anchors) = protect_anchors(content);

        let mut links: HashMap<String, String> = HashMap::new();
        for token in MENTION.find_iter(&protected) {
            let token = token.as_str();
            if links.contains_key(token) {
                continue;
            }
            let Some(feed_url) = known.get(token) else {
                continue;
            };
            if let Some(link) = self.mention_link(token, feed_url).await {
                links.insert(token.to_string(), link);
            }
        }

        let rewritten = MENTION.replace_all(&protected, |caps: &Captures| {
            links
                .get(&caps[0])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });

        restore_anchors(&rewritten, &anchors)
    }

    async fn mention_link(&self, token: &str, feed_url: &str) -> Option<String> {
        let actor = match self.resolver.resolve(feed_url).await {
            Ok(actor) => actor,
            Err(e) => {
                tracing::debug!(mention = %token, error = %e, "Leaving mention unlinked");
                return None;
            }
        };

        let href = actor.url.as_deref().or(actor.id.as_deref())?;
        let display = actor
            .preferred_username
            .as_deref()
            .or(actor.name.as_deref())
            .unwrap_or_else(|| token.trim_start_matches('@'));

        Some(format!(
            r#"<a rel="mention" class="u-url mention" href="{}">@<span>{}</span></a>"#,
            html_escape::encode_double_quoted_attribute(href),
            html_escape::encode_text(display)
        ))
    }
}

/// Swap every anchor for a numbered placeholder
fn protect_anchors(content: &str) -> (String, Vec<String>) {
    let mut anchors = Vec::new();
    let protected = ANCHOR.replace_all(content, |caps: &Captures| {
        let placeholder = format!("!#!#PROTECT{}#!#!", anchors.len());
        anchors.push(caps[0].to_string());
        placeholder
    });
    (protected.into_owned(), anchors)
}

fn restore_anchors(content: &str, anchors: &[String]) -> String {
    PLACEHOLDER
        .replace_all(content, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|index| anchors.get(index))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActorCache, FollowedFeed, InMemoryFeeds};
    use crate::federation::transport::MockFederationTransport;
    use serde_json::json;
    use std::time::Duration;

    async fn feeds_with_bob() -> Arc<InMemoryFeeds> {
        let feeds = Arc::new(InMemoryFeeds::new());
        feeds
            .upsert(FollowedFeed::activitypub("https://social.example/users/bob", "Bob"))
            .await;
        feeds
    }

    fn rewriter(feeds: Arc<InMemoryFeeds>, transport: MockFederationTransport) -> MentionRewriter {
        let resolver = Arc::new(ActorResolver::new(
            Arc::new(transport),
            ActorCache::new(100, Duration::from_secs(60)),
            Duration::from_secs(1),
        ));
        MentionRewriter::new(Arc::new(MentionTable::new(feeds, true)), resolver)
    }

    #[test]
    fn mention_slug_normalizes_logins() {
        assert_eq!(mention_slug("Bob"), "bob");
        assert_eq!(mention_slug("Mary Jane.Doe"), "mary-jane-doe");
        assert_eq!(mention_slug(" a--b!? "), "a-b");
        assert_eq!(mention_slug("under_score"), "under_score");
    }

    #[test]
    fn anchors_round_trip_through_placeholders() {
        let content = r#"<A HREF="https://x">one</A> and <a href='y'>two</a>"#;
        let (protected, anchors) = protect_anchors(content);
        assert_eq!(protected, "!#!#PROTECT0#!#! and !#!#PROTECT1#!#!");
        assert_eq!(restore_anchors(&protected, &anchors), content);
    }

    #[tokio::test]
    async fn rewrite_links_bare_mentions_but_not_anchors() {
        let mut transport = MockFederationTransport::new();
        transport.expect_resolve_actor().times(1).returning(|_| {
            Ok(json!({
                "id": "https://social.example/users/bob",
                "url": "https://social.example/@bob",
                "preferredUsername": "bob",
                "name": "Bob B."
            }))
        });

        let rewriter = rewriter(feeds_with_bob().await, transport);
        let content = r#"Hello @bob, see <a href="https://x">@bob</a> and @bob again"#;
        let rewritten = rewriter.rewrite(content).await;

        let link = r#"<a rel="mention" class="u-url mention" href="https://social.example/@bob">@<span>bob</span></a>"#;
        assert_eq!(
            rewritten,
            format!(
                r#"Hello {}, see <a href="https://x">@bob</a> and {} again"#,
                link, link
            )
        );
    }

    #[tokio::test]
    async fn rewrite_leaves_unknown_and_unresolvable_mentions() {
        let mut transport = MockFederationTransport::new();
        transport.expect_resolve_actor().returning(|_| {
            Err(crate::error::TransportError::Network("unreachable".to_string()))
        });

        let rewriter = rewriter(feeds_with_bob().await, transport);
        let content = "Hi @carol and @bob";
        assert_eq!(rewriter.rewrite(content).await, content);
    }

    #[tokio::test]
    async fn cached_table_is_rebuilt_after_invalidate() {
        let feeds = feeds_with_bob().await;
        let table = MentionTable::new(feeds.clone(), true);
        assert_eq!(table.get().await.unwrap().len(), 1);

        feeds
            .upsert(FollowedFeed::activitypub("https://other.example/users/carol", "carol"))
            .await;
        assert_eq!(table.get().await.unwrap().len(), 1);

        table.invalidate().await;
        assert_eq!(table.get().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn uncached_table_follows_feed_changes() {
        let feeds = feeds_with_bob().await;
        let table = MentionTable::new(feeds.clone(), false);
        assert_eq!(table.get().await.unwrap().len(), 1);

        feeds.remove("https://social.example/users/bob").await;
        assert!(table.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn extract_mentions_returns_known_slugs_only() {
        let table = MentionTable::new(feeds_with_bob().await, true);
        let mentions = extract_mentions(&table, "cc @bob @nobody").await.unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions["@bob"], "https://social.example/users/bob");
    }
}
