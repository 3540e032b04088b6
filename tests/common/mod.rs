//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use friends_federation::data::{FollowedFeed, InMemoryFeeds};
use friends_federation::error::TransportError;
use friends_federation::federation::{FederationTransport, TransportResponse};
use friends_federation::{AppState, config};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// A delivery captured by the stub transport
#[derive(Debug, Clone)]
pub struct Delivered {
    pub inbox: String,
    pub activity: Value,
    pub acting_user: String,
}

/// Scriptable federation transport
///
/// Actors, objects and inboxes are registered up front; deliveries are
/// recorded and answered with a configurable status.
#[derive(Default)]
pub struct StubTransport {
    actors: Mutex<HashMap<String, Value>>,
    objects: Mutex<HashMap<String, (u16, String)>>,
    inboxes: Mutex<HashMap<String, String>>,
    followers: Mutex<BTreeMap<String, Vec<String>>>,
    delivery_status: Mutex<Option<(u16, String)>>,
    delivered: Mutex<Vec<Delivered>>,
    delay: Mutex<Option<Duration>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor document under every key it can be looked up by
    pub async fn add_actor(&self, keys: &[&str], document: Value) {
        let mut actors = self.actors.lock().await;
        for key in keys {
            actors.insert(key.to_string(), document.clone());
        }
        if let Some(inbox) = document.get("inbox").and_then(Value::as_str) {
            let mut inboxes = self.inboxes.lock().await;
            for key in keys {
                inboxes.insert(key.to_string(), inbox.to_string());
            }
        }
    }

    pub async fn add_object(&self, url: &str, status: u16, body: Value) {
        self.objects
            .lock()
            .await
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub async fn add_follower_inbox(&self, inbox: &str, followers: &[&str]) {
        self.followers.lock().await.insert(
            inbox.to_string(),
            followers.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub async fn answer_deliveries_with(&self, status: u16, message: &str) {
        *self.delivery_status.lock().await = Some((status, message.to_string()));
    }

    /// Make every call sleep before answering
    pub async fn slow_down(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub async fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().await.clone()
    }

    async fn maybe_wait(&self) {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl FederationTransport for StubTransport {
    async fn resolve_actor(&self, url_or_handle: &str) -> Result<Value, TransportError> {
        self.maybe_wait().await;
        self.actors
            .lock()
            .await
            .get(url_or_handle)
            .cloned()
            .ok_or(TransportError::Status {
                status: 404,
                message: "Not Found".to_string(),
            })
    }

    async fn inbox_for_actor(&self, actor_url: &str) -> Result<String, TransportError> {
        self.maybe_wait().await;
        self.inboxes
            .lock()
            .await
            .get(actor_url)
            .cloned()
            .ok_or_else(|| TransportError::InvalidResponse(format!("no inbox for {}", actor_url)))
    }

    async fn follower_inboxes(
        &self,
        _local_user: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, TransportError> {
        Ok(self.followers.lock().await.clone())
    }

    async fn dereference(
        &self,
        url: &str,
        _acting_user: &str,
    ) -> Result<TransportResponse, TransportError> {
        self.maybe_wait().await;
        let (status, body) = self
            .objects
            .lock()
            .await
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(TransportResponse {
            status,
            message: if status == 200 { "OK" } else { "Not Found" }.to_string(),
            body,
        })
    }

    async fn deliver(
        &self,
        inbox: &str,
        activity: &Value,
        acting_user: &str,
    ) -> Result<TransportResponse, TransportError> {
        self.maybe_wait().await;
        self.delivered.lock().await.push(Delivered {
            inbox: inbox.to_string(),
            activity: activity.clone(),
            acting_user: acting_user.to_string(),
        });
        let (status, message) = self
            .delivery_status
            .lock()
            .await
            .clone()
            .unwrap_or((202, "Accepted".to_string()));
        Ok(TransportResponse {
            status,
            message,
            body: String::new(),
        })
    }
}

/// Test configuration
pub fn test_config() -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "blog.test.net".to_string(),
            protocol: "https".to_string(),
        },
        federation: config::FederationConfig {
            user_agent: "FriendsFederation/test".to_string(),
            request_timeout_secs: 2,
            delivery_workers: 2,
            max_concurrent_deliveries: 4,
            main_user: "admin".to_string(),
        },
        cache: config::CacheConfig {
            actor_ttl_secs: 60,
            actor_max_entries: 100,
            cache_mentions: true,
            seen_activity_ttl_secs: 60,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
        feeds: Vec::new(),
        followers: Vec::new(),
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub transport: Arc<StubTransport>,
    pub feeds: Arc<InMemoryFeeds>,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_transport(StubTransport::new()).await
    }

    pub async fn with_transport(transport: StubTransport) -> Self {
        friends_federation::metrics::init_metrics();

        let transport = Arc::new(transport);
        let feeds = Arc::new(InMemoryFeeds::new());
        let state = AppState::new(test_config(), transport.clone(), feeds.clone());
        state.spawn_delivery_workers();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = friends_federation::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            transport,
            feeds,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Follow an ActivityPub actor as a friend user
    pub async fn follow_feed(&self, url: &str, friend_login: &str) {
        self.feeds
            .upsert(FollowedFeed::activitypub(url, friend_login))
            .await;
        self.state.invalidate_mentions().await;
    }

    /// POST a JSON activity to an inbox path
    pub async fn post_activity(&self, path: &str, activity: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("Content-Type", "application/activity+json")
            .body(activity.to_string())
            .send()
            .await
            .unwrap()
    }
}

/// Poll until `check` holds or the timeout expires
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
