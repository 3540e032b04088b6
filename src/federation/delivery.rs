//! Activity delivery
//!
//! Executes queued jobs against the federation transport and performs
//! the Announce fan-out to follower inboxes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::actor::ActorResolver;
use super::builder::{self, OutboundActivity, Verb};
use super::queue::{DeliveryJob, JobRunner};
use super::transport::{FederationTransport, TransportResponse, with_deadline};
use crate::data::FeedRepository;
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERY_DURATION_SECONDS};

/// Result of a delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Target inbox, when the attempt got far enough to know it
    pub inbox_uri: Option<String>,
    /// Whether the remote answered with 2xx
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code if the remote answered
    pub status_code: Option<u16>,
}

impl DeliveryResult {
    fn from_response(inbox_uri: &str, response: &TransportResponse) -> Self {
        Self {
            inbox_uri: Some(inbox_uri.to_string()),
            success: response.is_success(),
            error: (!response.is_success())
                .then(|| format!("HTTP {} {}", response.status, response.message)),
            status_code: Some(response.status),
        }
    }

    fn from_error(inbox_uri: Option<&str>, error: &AppError) -> Self {
        Self {
            inbox_uri: inbox_uri.map(str::to_string),
            success: false,
            error: Some(error.to_string()),
            status_code: None,
        }
    }
}

/// Deduplicate recipients while keeping their first-seen order
fn unique_recipients(recipients: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|recipient| seen.insert(recipient.clone()))
        .collect()
}

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    transport: Arc<dyn FederationTransport>,
    resolver: Arc<ActorResolver>,
    feeds: Arc<dyn FeedRepository>,
    /// Base URL local actor URLs are built from
    base_url: String,
    deadline: Duration,
    max_concurrent: usize,
}

impl ActivityDelivery {
    pub fn new(
        transport: Arc<dyn FederationTransport>,
        resolver: Arc<ActorResolver>,
        feeds: Arc<dyn FeedRepository>,
        base_url: &str,
        deadline: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            transport,
            resolver,
            feeds,
            base_url: base_url.trim_end_matches('/').to_string(),
            deadline,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Actor URL of a local user
    pub fn local_actor_url(&self, user: &str) -> String {
        format!("{}/users/{}", self.base_url, user)
    }

    /// Deliver an activity to a single inbox
    ///
    /// A non-2xx answer is returned as a response, not an error.
    ///
    /// # Errors
    /// Returns `Transport` when the inbox could not be reached in time
    pub async fn deliver_to_inbox(
        &self,
        inbox_uri: &str,
        activity: &OutboundActivity,
        acting_user: &str,
    ) -> Result<TransportResponse, AppError> {
        let verb = format!("{:?}", activity.kind);
        let _timer = DELIVERY_DURATION_SECONDS
            .with_label_values(&[verb.as_str()])
            .start_timer();

        let body = activity.to_json()?;
        let result = with_deadline(
            self.deadline,
            self.transport.deliver(inbox_uri, &body, acting_user),
        )
        .await;

        let outcome = match &result {
            Ok(response) if response.is_success() => "success",
            _ => "failure",
        };
        ACTIVITIES_SENT
            .with_label_values(&[verb.as_str(), outcome])
            .inc();

        let response = result?;
        tracing::info!(
            inbox = %inbox_uri,
            id = %activity.id,
            status = response.status,
            "Delivered activity"
        );
        Ok(response)
    }

    /// Build the activity for a job and send it to the target's inbox
    async fn execute(&self, job: &DeliveryJob) -> (Option<String>, Result<TransportResponse, AppError>) {
        let actor = self.local_actor_url(&job.acting_user);

        let (target, inbox_owner) = match job.verb {
            Verb::Follow | Verb::Unfollow => {
                match self.resolver.canonical_url(&job.feed_url).await {
                    Ok(target) => (target.clone(), target),
                    Err(e) => return (None, Err(e)),
                }
            }
            Verb::Like | Verb::Unlike => match &job.object {
                Some(object) => (object.clone(), job.feed_url.clone()),
                None => {
                    return (
                        None,
                        Err(AppError::Validation(format!(
                            "{} job without an object",
                            job.verb
                        ))),
                    );
                }
            },
            Verb::Announce => {
                return (
                    None,
                    Err(AppError::Validation(
                        "announce is delivered to followers".to_string(),
                    )),
                );
            }
        };

        let inbox = match with_deadline(self.deadline, self.transport.inbox_for_actor(&inbox_owner))
            .await
        {
            Ok(inbox) => inbox,
            Err(e) => return (None, Err(e.into())),
        };

        let activity = builder::build(job.verb, &actor, &target, None);
        let response = self
            .deliver_to_inbox(&inbox, &activity, &job.acting_user)
            .await;
        (Some(inbox), response)
    }

    /// Execute a job and write the outcome to the feed's log
    pub async fn run_job(&self, job: &DeliveryJob) -> DeliveryResult {
        let (inbox, result) = self.execute(job).await;
        self.record(&job.feed_url, job.verb, inbox.as_deref(), &result)
            .await
    }

    /// Write an attempt's outcome to a feed log and summarise it
    async fn record(
        &self,
        feed_url: &str,
        verb: Verb,
        inbox: Option<&str>,
        result: &Result<TransportResponse, AppError>,
    ) -> DeliveryResult {
        let (message, delivery_result) = match result {
            Ok(response) => (
                format!(
                    "Sent {} request with response: {} {}",
                    verb, response.status, response.message
                ),
                DeliveryResult::from_response(inbox.unwrap_or_default(), response),
            ),
            Err(e) => (format!("Error: {}", e), DeliveryResult::from_error(inbox, e)),
        };

        if let Err(e) = self.feeds.update_last_log(feed_url, &message).await {
            tracing::warn!(feed = %feed_url, error = %e, "Failed to update feed log");
        }

        delivery_result
    }

    /// Announce an object to all followers of a local user
    ///
    /// One POST per distinct inbox, `to` listing the followers reached
    /// through that inbox. Deliveries run in parallel. When `feed_url`
    /// is given, every attempt is written to that feed's log.
    pub async fn announce(
        &self,
        object_url: &str,
        acting_user: &str,
        feed_url: Option<&str>,
    ) -> Vec<DeliveryResult> {
        use tokio::sync::Semaphore;

        let inboxes = match with_deadline(
            self.deadline,
            self.transport.follower_inboxes(acting_user),
        )
        .await
        {
            Ok(inboxes) => inboxes,
            Err(e) => {
                tracing::warn!(user = %acting_user, error = %e, "Failed to load follower inboxes");
                let error = AppError::from(e);
                return match feed_url {
                    Some(feed_url) => vec![
                        self.record(feed_url, Verb::Announce, None, &Err(error))
                            .await,
                    ],
                    None => vec![DeliveryResult::from_error(None, &error)],
                };
            }
        };

        tracing::info!(
            object = %object_url,
            inboxes = inboxes.len(),
            "Announcing to followers"
        );

        let actor = self.local_actor_url(acting_user);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::new();

        for (inbox_uri, followers) in inboxes {
            let activity = builder::announce(&actor, object_url, unique_recipients(followers));
            let semaphore = semaphore.clone();
            let this = self.clone();
            let acting_user = acting_user.to_string();
            let feed_url = feed_url.map(str::to_string);

            tasks.push(tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => this.deliver_to_inbox(&inbox_uri, &activity, &acting_user).await,
                    Err(_) => Err(AppError::Internal(anyhow::anyhow!("delivery limiter closed"))),
                };

                if let Err(e) = &result {
                    tracing::warn!(inbox = %inbox_uri, error = %e, "Announce delivery failed");
                }

                match feed_url {
                    Some(feed_url) => {
                        this.record(&feed_url, Verb::Announce, Some(&inbox_uri), &result)
                            .await
                    }
                    None => match &result {
                        Ok(response) => DeliveryResult::from_response(&inbox_uri, response),
                        Err(e) => DeliveryResult::from_error(Some(&inbox_uri), e),
                    },
                }
            }));
        }

        let mut results = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Announce delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Announce delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }
}

#[async_trait]
impl JobRunner for ActivityDelivery {
    async fn run(&self, job: DeliveryJob) -> DeliveryResult {
        self.run_job(&job).await
    }
}
