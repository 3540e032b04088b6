//! Federation transport
//!
//! The capability the core uses for every network call: actor lookup,
//! inbox lookup, follower inboxes, object fetch and activity delivery.
//! `HttpTransport` is the reqwest-backed implementation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::webfinger::{ActorRef, WebFingerResponse};
use crate::config::FollowerSeed;
use crate::error::TransportError;

const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Answer of a remote server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Reason phrase of the status line
    pub message: String,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx answer into a `TransportError::Status`
    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status,
                message: self.message,
            })
        }
    }

    /// Parse the body as JSON
    pub fn json(&self) -> Result<Value, TransportError> {
        serde_json::from_str(&self.body)
            .map_err(|e| TransportError::InvalidResponse(format!("body is not JSON: {}", e)))
    }
}

/// Network capability consumed by the federation core
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FederationTransport: Send + Sync {
    /// Fetch the actor document for a handle or URL
    async fn resolve_actor(&self, url_or_handle: &str) -> Result<Value, TransportError>;

    /// Inbox to deliver to for an actor
    async fn inbox_for_actor(&self, actor_url: &str) -> Result<String, TransportError>;

    /// Follower inboxes of a local user, with the follower actors behind each inbox
    async fn follower_inboxes(
        &self,
        local_user: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, TransportError>;

    /// GET an object on behalf of a local user
    async fn dereference(&self, url: &str, acting_user: &str)
    -> Result<TransportResponse, TransportError>;

    /// POST an activity to an inbox on behalf of a local user
    async fn deliver(
        &self,
        inbox: &str,
        activity: &Value,
        acting_user: &str,
    ) -> Result<TransportResponse, TransportError>;
}

/// Run a transport call under a deadline
///
/// Expiry is reported as `TransportError::Timeout`; the call is dropped.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(deadline)),
    }
}

// =============================================================================
// Request signing
// =============================================================================

/// Adds signature headers to outgoing requests
///
/// Key material and cryptography live with the host; the transport only
/// asks for the headers to attach.
pub trait RequestSigner: Send + Sync {
    fn sign(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        acting_user: &str,
    ) -> Result<Vec<(String, String)>, TransportError>;
}

// =============================================================================
// Followers
// =============================================================================

/// A remote follower of a local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follower {
    pub actor: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
}

impl Follower {
    /// Shared inbox when the server has one
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }
}

/// Followers of local users
#[derive(Default)]
pub struct FollowerRegistry {
    followers: RwLock<HashMap<String, Vec<Follower>>>,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the followers declared in configuration
    pub async fn from_seeds(seeds: &[FollowerSeed]) -> Self {
        let registry = Self::new();
        for seed in seeds {
            registry
                .add(
                    &seed.local_user,
                    Follower {
                        actor: seed.actor.clone(),
                        inbox: seed.inbox.clone(),
                        shared_inbox: seed.shared_inbox.clone(),
                    },
                )
                .await;
        }
        registry
    }

    /// Record a follower; a known follower actor is replaced
    pub async fn add(&self, local_user: &str, follower: Follower) {
        let mut followers = self.followers.write().await;
        let list = followers.entry(local_user.to_string()).or_default();
        list.retain(|existing| existing.actor != follower.actor);
        list.push(follower);
    }

    pub async fn remove(&self, local_user: &str, actor: &str) {
        let mut followers = self.followers.write().await;
        if let Some(list) = followers.get_mut(local_user) {
            list.retain(|existing| existing.actor != actor);
        }
    }

    /// Followers grouped by the inbox they are reached through
    ///
    /// Actors behind the same shared inbox end up in one group,
    /// each actor listed once.
    pub async fn grouped_by_inbox(&self, local_user: &str) -> BTreeMap<String, Vec<String>> {
        let followers = self.followers.read().await;
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for follower in followers.get(local_user).into_iter().flatten() {
            let actors = groups
                .entry(follower.delivery_inbox().to_string())
                .or_default();
            if !actors.contains(&follower.actor) {
                actors.push(follower.actor.clone());
            }
        }

        groups
    }
}

// =============================================================================
// HTTP transport
// =============================================================================

/// Federation transport over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    deadline: Duration,
    signer: Option<Arc<dyn RequestSigner>>,
    followers: Arc<FollowerRegistry>,
}

impl HttpTransport {
    /// Create a transport
    ///
    /// # Arguments
    /// * `user_agent` - User-Agent header for every request
    /// * `deadline` - Upper bound for a single call
    pub fn new(user_agent: &str, deadline: Duration) -> Result<Self, crate::error::AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(deadline)
            .build()?;

        Ok(Self {
            http_client,
            deadline,
            signer: None,
            followers: Arc::new(FollowerRegistry::new()),
        })
    }

    /// Sign every request with the given signer
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Use a shared follower registry
    pub fn with_followers(mut self, followers: Arc<FollowerRegistry>) -> Self {
        self.followers = followers;
        self
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.deadline)
        } else {
            TransportError::Network(error.to_string())
        }
    }

    async fn send(
        &self,
        mut request: reqwest::RequestBuilder,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        acting_user: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        if let (Some(signer), Some(acting_user)) = (&self.signer, acting_user) {
            for (name, value) in signer.sign(method, url, body, acting_user)? {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        Ok(TransportResponse {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }

    async fn get_json(&self, url: &str, accept: &str) -> Result<Value, TransportError> {
        let request = self.http_client.get(url).header("Accept", accept);
        self.send(request, "GET", url, None, None)
            .await?
            .error_for_status()?
            .json()
    }

    async fn fetch_actor(&self, url_or_handle: &str) -> Result<Value, TransportError> {
        let actor_ref = ActorRef::parse(url_or_handle).ok_or_else(|| {
            TransportError::InvalidResponse(format!("not a handle or URL: {}", url_or_handle))
        })?;

        let actor_url = match actor_ref {
            ActorRef::Url(url) => url,
            ActorRef::Handle(handle) => {
                let jrd = self
                    .get_json(&handle.webfinger_url(), "application/jrd+json")
                    .await?;
                let jrd: WebFingerResponse = serde_json::from_value(jrd).map_err(|e| {
                    TransportError::InvalidResponse(format!("invalid WebFinger response: {}", e))
                })?;
                jrd.actor_uri().map(str::to_string).ok_or_else(|| {
                    TransportError::InvalidResponse(format!("no actor link for {}", handle))
                })?
            }
        };

        tracing::debug!(actor = %actor_url, "Fetching actor document");
        self.get_json(&actor_url, ACCEPT_ACTIVITY).await
    }
}

#[async_trait]
impl FederationTransport for HttpTransport {
    async fn resolve_actor(&self, url_or_handle: &str) -> Result<Value, TransportError> {
        with_deadline(self.deadline, self.fetch_actor(url_or_handle)).await
    }

    async fn inbox_for_actor(&self, actor_url: &str) -> Result<String, TransportError> {
        let document = self.resolve_actor(actor_url).await?;

        document
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .or_else(|| document.get("inbox").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::InvalidResponse(format!("actor {} has no inbox", actor_url))
            })
    }

    async fn follower_inboxes(
        &self,
        local_user: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, TransportError> {
        Ok(self.followers.grouped_by_inbox(local_user).await)
    }

    async fn dereference(
        &self,
        url: &str,
        acting_user: &str,
    ) -> Result<TransportResponse, TransportError> {
        let request = self.http_client.get(url).header("Accept", ACCEPT_ACTIVITY);
        with_deadline(
            self.deadline,
            self.send(request, "GET", url, None, Some(acting_user)),
        )
        .await
    }

    async fn deliver(
        &self,
        inbox: &str,
        activity: &Value,
        acting_user: &str,
    ) -> Result<TransportResponse, TransportError> {
        let body = serde_json::to_vec(activity).map_err(|e| {
            TransportError::InvalidResponse(format!("failed to serialize activity: {}", e))
        })?;

        let request = self
            .http_client
            .post(inbox)
            .header("Content-Type", ACTIVITY_JSON)
            .body(body.clone());

        with_deadline(
            self.deadline,
            self.send(request, "POST", inbox, Some(&body), Some(acting_user)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower(actor: &str, inbox: &str, shared: Option<&str>) -> Follower {
        Follower {
            actor: actor.to_string(),
            inbox: inbox.to_string(),
            shared_inbox: shared.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn grouped_by_inbox_batches_actors_behind_shared_inbox() {
        let registry = FollowerRegistry::new();
        registry
            .add(
                "admin",
                follower(
                    "https://one.example/users/alice",
                    "https://one.example/users/alice/inbox",
                    Some("https://one.example/inbox"),
                ),
            )
            .await;
        registry
            .add(
                "admin",
                follower(
                    "https://one.example/users/bob",
                    "https://one.example/users/bob/inbox",
                    Some("https://one.example/inbox"),
                ),
            )
            .await;
        registry
            .add(
                "admin",
                follower(
                    "https://two.example/users/carol",
                    "https://two.example/users/carol/inbox",
                    None,
                ),
            )
            .await;

        let groups = registry.grouped_by_inbox("admin").await;
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups["https://one.example/inbox"],
            vec![
                "https://one.example/users/alice".to_string(),
                "https://one.example/users/bob".to_string()
            ]
        );
        assert_eq!(
            groups["https://two.example/users/carol/inbox"],
            vec!["https://two.example/users/carol".to_string()]
        );
        assert!(registry.grouped_by_inbox("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn registry_is_seeded_from_configuration() {
        let seeds = vec![
            FollowerSeed {
                local_user: "admin".to_string(),
                actor: "https://one.example/users/alice".to_string(),
                inbox: "https://one.example/users/alice/inbox".to_string(),
                shared_inbox: Some("https://one.example/inbox".to_string()),
            },
            FollowerSeed {
                local_user: "editor".to_string(),
                actor: "https://two.example/users/carol".to_string(),
                inbox: "https://two.example/users/carol/inbox".to_string(),
                shared_inbox: None,
            },
        ];

        let registry = FollowerRegistry::from_seeds(&seeds).await;

        let transport = HttpTransport::new("FriendsFederation/test", Duration::from_secs(1))
            .unwrap()
            .with_followers(Arc::new(registry));
        let groups = transport.follower_inboxes("admin").await.unwrap();
        assert_eq!(
            groups,
            BTreeMap::from([(
                "https://one.example/inbox".to_string(),
                vec!["https://one.example/users/alice".to_string()]
            )])
        );
        assert_eq!(transport.follower_inboxes("editor").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn adding_known_follower_replaces_entry() {
        let registry = FollowerRegistry::new();
        registry
            .add("admin", follower("https://one.example/users/alice", "https://one.example/a", None))
            .await;
        registry
            .add(
                "admin",
                follower(
                    "https://one.example/users/alice",
                    "https://one.example/users/alice/inbox",
                    Some("https://one.example/inbox"),
                ),
            )
            .await;

        let groups = registry.grouped_by_inbox("admin").await;
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key("https://one.example/inbox"));

        registry.remove("admin", "https://one.example/users/alice").await;
        assert!(registry.grouped_by_inbox("admin").await.is_empty());
    }

    struct StaticSigner;

    impl RequestSigner for StaticSigner {
        fn sign(
            &self,
            method: &str,
            _url: &str,
            body: Option<&[u8]>,
            acting_user: &str,
        ) -> Result<Vec<(String, String)>, TransportError> {
            Ok(vec![(
                "signature".to_string(),
                format!("{} {} {}", method, acting_user, body.map_or(0, <[u8]>::len)),
            )])
        }
    }

    #[tokio::test]
    async fn deliver_posts_signed_activity() {
        use axum::{Router, http::HeaderMap, http::StatusCode, routing::post};

        let app = Router::new().route(
            "/inbox",
            post(|headers: HeaderMap, body: String| async move {
                let signature = headers
                    .get("signature")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let content_type = headers
                    .get("content-type")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (StatusCode::ACCEPTED, format!("{}|{}|{}", signature, content_type, body.len()))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = HttpTransport::new("FriendsFederation/test", Duration::from_secs(2))
            .unwrap()
            .with_signer(Arc::new(StaticSigner));
        let activity = serde_json::json!({ "type": "Follow" });
        let length = serde_json::to_vec(&activity).unwrap().len();

        let response = transport
            .deliver(&format!("http://{}/inbox", addr), &activity, "admin")
            .await
            .unwrap();

        assert_eq!(response.status, 202);
        assert_eq!(response.message, "Accepted");
        assert_eq!(
            response.body,
            format!("POST admin {}|{}|{}", length, ACTIVITY_JSON, length)
        );
    }

    #[tokio::test]
    async fn with_deadline_reports_timeout() {
        let result: Result<(), TransportError> = with_deadline(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(TransportError::Timeout(Duration::from_millis(20))));
    }

    #[test]
    fn error_for_status_keeps_status_line() {
        let response = TransportResponse {
            status: 404,
            message: "Not Found".to_string(),
            body: String::new(),
        };
        assert_eq!(
            response.error_for_status(),
            Err(TransportError::Status {
                status: 404,
                message: "Not Found".to_string()
            })
        );
    }
}
