//! Actor resolution
//!
//! Turns a handle or URL into `RemoteActor` metadata through the
//! federation transport, memoising successful lookups.

use std::sync::Arc;
use std::time::Duration;

use super::transport::{FederationTransport, with_deadline};
use super::webfinger::ActorRef;
use crate::data::{ActorCache, RemoteActor};
use crate::error::{AppError, TransportError};

// =============================================================================
// Placeholder domains
// =============================================================================

/// Decides whether an account lives on a documentation placeholder domain
///
/// Lookups against such domains never succeed, so the resolver answers
/// them with a stub actor instead of asking the network.
pub trait PlaceholderPolicy: Send + Sync {
    fn is_placeholder(&self, username: &str, domain: &str) -> bool;
}

/// Matches `example.*`, `my-domain`-style names, anything with `test`
/// in the domain, and the username `example`
#[derive(Debug, Clone, Copy, Default)]
pub struct ExampleDomainPolicy;

impl PlaceholderPolicy for ExampleDomainPolicy {
    fn is_placeholder(&self, username: &str, domain: &str) -> bool {
        if domain.is_empty()
            || !domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return false;
        }

        let first_label = domain.split('.').next().unwrap_or_default();
        if first_label.trim_end_matches(|c: char| c.is_ascii_digit()) == "example" {
            return true;
        }

        ["my-domain", "your-domain", "our-domain"]
            .iter()
            .any(|pattern| domain.contains(pattern))
            || domain.contains("test")
            || username == "example"
    }
}

/// Never treats a domain as placeholder
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlaceholders;

impl PlaceholderPolicy for NoPlaceholders {
    fn is_placeholder(&self, _username: &str, _domain: &str) -> bool {
        false
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Actor resolver
///
/// Resolution results are cached by the normalized input. Failures are
/// returned as typed errors and never cached.
pub struct ActorResolver {
    transport: Arc<dyn FederationTransport>,
    cache: ActorCache,
    policy: Arc<dyn PlaceholderPolicy>,
    deadline: Duration,
}

impl ActorResolver {
    pub fn new(
        transport: Arc<dyn FederationTransport>,
        cache: ActorCache,
        deadline: Duration,
    ) -> Self {
        Self {
            transport,
            cache,
            policy: Arc::new(ExampleDomainPolicy),
            deadline,
        }
    }

    /// Replace the placeholder-domain policy
    pub fn with_policy(mut self, policy: Arc<dyn PlaceholderPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve a handle or URL
    ///
    /// # Errors
    /// - `NotFound` for empty input or when the remote reports the actor gone
    /// - `Transport` for network failures, timeouts and unusable documents
    /// - `AmbiguousActor` when the document has neither `id` nor `url`
    pub async fn resolve(&self, handle_or_url: &str) -> Result<Arc<RemoteActor>, AppError> {
        let actor_ref = ActorRef::parse(handle_or_url).ok_or(AppError::NotFound)?;
        let key = actor_ref.to_string();

        if let Some(actor) = self.cache.get(&key).await {
            return Ok(actor);
        }

        if let Some((username, domain)) = actor_ref.username_and_domain() {
            if self.policy.is_placeholder(&username, &domain) {
                tracing::debug!(actor = %key, "Using placeholder actor");
                let actor = Arc::new(RemoteActor::placeholder(&domain, &username));
                self.cache.insert(&key, actor.clone()).await;
                return Ok(actor);
            }
        }

        let document = with_deadline(self.deadline, self.transport.resolve_actor(&key))
            .await
            .map_err(|e| match e {
                TransportError::Status {
                    status: 404 | 410, ..
                } => AppError::NotFound,
                other => AppError::Transport(other),
            })?;

        let actor = RemoteActor::from_document(&document).ok_or_else(|| {
            AppError::Transport(TransportError::InvalidResponse(format!(
                "actor document for {} is not an object",
                key
            )))
        })?;

        if actor.canonical_url().is_none() {
            return Err(AppError::AmbiguousActor(key));
        }

        tracing::debug!(actor = %key, id = ?actor.id, "Resolved actor");
        let actor = Arc::new(actor);
        self.cache.insert(&key, actor.clone()).await;
        Ok(actor)
    }

    /// Resolve and return the actor's canonical URL (id, falling back to url)
    pub async fn canonical_url(&self, handle_or_url: &str) -> Result<String, AppError> {
        let actor = self.resolve(handle_or_url).await?;
        actor
            .canonical_url()
            .map(str::to_string)
            .ok_or_else(|| AppError::AmbiguousActor(handle_or_url.to_string()))
    }

    /// Forget a memoised actor so the next lookup hits the network
    pub async fn invalidate(&self, handle_or_url: &str) {
        if let Some(actor_ref) = ActorRef::parse(handle_or_url) {
            self.cache.invalidate(&actor_ref.to_string()).await;
        }
    }
}
