//! Outbound delivery queue
//!
//! One-shot follow/unfollow/like/unlike jobs, at most one pending per
//! key. Enqueuing a job cancels a pending job of the opposing verb for
//! the same target. Jobs are drained by a pool of workers; a job that
//! a worker has claimed can no longer be cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::builder::Verb;
use super::delivery::DeliveryResult;
use crate::data::EntityId;
use crate::error::AppError;
use crate::metrics::QUEUE_PENDING;

/// A queued outbound action
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryJob {
    pub verb: Verb,
    /// Followed feed the action belongs to; its log receives the outcome
    pub feed_url: String,
    /// Liked object for like/unlike
    pub object: Option<String>,
    /// Local user performing the action
    pub acting_user: String,
}

impl DeliveryJob {
    pub fn follow(feed_url: &str, acting_user: &str) -> Self {
        Self::new(Verb::Follow, feed_url, None, acting_user)
    }

    pub fn unfollow(feed_url: &str, acting_user: &str) -> Self {
        Self::new(Verb::Unfollow, feed_url, None, acting_user)
    }

    pub fn like(feed_url: &str, object: &str, acting_user: &str) -> Self {
        Self::new(Verb::Like, feed_url, Some(object), acting_user)
    }

    pub fn unlike(feed_url: &str, object: &str, acting_user: &str) -> Self {
        Self::new(Verb::Unlike, feed_url, Some(object), acting_user)
    }

    fn new(verb: Verb, feed_url: &str, object: Option<&str>, acting_user: &str) -> Self {
        Self {
            verb,
            feed_url: feed_url.to_string(),
            object: object.map(str::to_string),
            acting_user: acting_user.to_string(),
        }
    }

    /// The same job with the opposing verb
    fn opposing(&self) -> Option<Self> {
        let verb = match self.verb {
            Verb::Follow => Verb::Unfollow,
            Verb::Unfollow => Verb::Follow,
            Verb::Like => Verb::Unlike,
            Verb::Unlike => Verb::Like,
            Verb::Announce => return None,
        };
        Some(Self {
            verb,
            ..self.clone()
        })
    }
}

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The same job is already waiting; nothing was added
    AlreadyPending,
}

/// Executes claimed jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: DeliveryJob) -> DeliveryResult;
}

struct QueuedJob {
    id: EntityId,
    job: DeliveryJob,
}

/// A pending job that has not been handed to the workers
#[must_use = "a reservation does nothing until it is dispatched"]
pub struct Reservation(QueuedJob);

impl Reservation {
    pub fn job(&self) -> &DeliveryJob {
        &self.0.job
    }
}

/// Delivery queue
///
/// `pending` maps every waiting job to the id of its queue entry.
/// Entries whose id is no longer in `pending` were cancelled and are
/// skipped by the workers.
pub struct DeliveryQueue {
    pending: Mutex<HashMap<DeliveryJob, EntityId>>,
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            pending: Mutex::new(HashMap::new()),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Schedule a job
    ///
    /// A pending job with the opposing verb for the same target is
    /// cancelled first. Scheduling a job that is already pending is a no-op.
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<EnqueueOutcome, AppError> {
        match self.reserve(job).await? {
            Some(reservation) => {
                self.dispatch(reservation).await?;
                Ok(EnqueueOutcome::Queued)
            }
            None => Ok(EnqueueOutcome::AlreadyPending),
        }
    }

    /// Mark a job pending without handing it to the workers yet
    ///
    /// Returns `None` when the job is already pending. Until the
    /// reservation is dispatched no worker can run the job, though an
    /// opposing enqueue may still cancel it.
    pub async fn reserve(&self, job: DeliveryJob) -> Result<Option<Reservation>, AppError> {
        let opposing = job.opposing().ok_or_else(|| {
            AppError::Validation(format!("{} jobs are not queued", job.verb))
        })?;

        let mut pending = self.pending.lock().await;

        if pending.remove(&opposing).is_some() {
            tracing::info!(
                verb = %opposing.verb,
                feed = %opposing.feed_url,
                "Cancelled pending job"
            );
        }

        if pending.contains_key(&job) {
            QUEUE_PENDING.set(pending.len() as i64);
            return Ok(None);
        }

        let id = EntityId::new();
        pending.insert(job.clone(), id.clone());
        QUEUE_PENDING.set(pending.len() as i64);

        Ok(Some(Reservation(QueuedJob { id, job })))
    }

    /// Hand a reserved job to the workers
    pub async fn dispatch(&self, reservation: Reservation) -> Result<(), AppError> {
        let Reservation(queued) = reservation;
        if let Err(mpsc::error::SendError(queued)) = self.sender.send(queued) {
            let mut pending = self.pending.lock().await;
            if pending.get(&queued.job) == Some(&queued.id) {
                pending.remove(&queued.job);
            }
            QUEUE_PENDING.set(pending.len() as i64);
            return Err(AppError::Internal(anyhow::anyhow!("delivery queue is closed")));
        }
        Ok(())
    }

    /// Whether a job is waiting to be executed
    pub async fn is_pending(&self, job: &DeliveryJob) -> bool {
        self.pending.lock().await.contains_key(job)
    }

    /// Number of waiting jobs
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Jobs currently waiting
    pub async fn pending_jobs(&self) -> Vec<DeliveryJob> {
        self.pending.lock().await.keys().cloned().collect()
    }

    /// Take a queue entry for execution
    ///
    /// Returns `None` when the entry was cancelled or superseded.
    async fn claim(&self, queued: QueuedJob) -> Option<DeliveryJob> {
        let mut pending = self.pending.lock().await;
        if pending.get(&queued.job) != Some(&queued.id) {
            return None;
        }
        pending.remove(&queued.job);
        QUEUE_PENDING.set(pending.len() as i64);
        Some(queued.job)
    }

    /// Wait for the next job that is still pending
    ///
    /// Returns `None` once the queue has been dropped.
    pub async fn next_job(&self) -> Option<DeliveryJob> {
        loop {
            let queued = self.receiver.lock().await.recv().await?;
            if let Some(job) = self.claim(queued).await {
                return Some(job);
            }
            tracing::debug!("Skipping cancelled job");
        }
    }

    /// Start `count` workers draining the queue
    pub fn spawn_workers(
        self: &Arc<Self>,
        runner: Arc<dyn JobRunner>,
        count: usize,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let queue = self.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Delivery worker started");
                    while let Some(job) = queue.next_job().await {
                        let result = runner.run(job.clone()).await;
                        if result.success {
                            tracing::info!(
                                worker,
                                verb = %job.verb,
                                feed = %job.feed_url,
                                status = ?result.status_code,
                                "Delivered job"
                            );
                        } else {
                            tracing::warn!(
                                worker,
                                verb = %job.verb,
                                feed = %job.feed_url,
                                error = ?result.error,
                                "Job failed"
                            );
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FEED: &str = "https://mastodon.example/users/alice";

    fn delivered(job: &DeliveryJob) -> DeliveryResult {
        DeliveryResult {
            inbox_uri: Some(format!("{}/inbox", job.feed_url)),
            success: true,
            error: None,
            status_code: Some(202),
        }
    }

    #[tokio::test]
    async fn opposing_enqueue_cancels_pending_job() {
        let queue = DeliveryQueue::new();

        assert_eq!(
            queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(DeliveryJob::unfollow(FEED, "admin")).await.unwrap(),
            EnqueueOutcome::Queued
        );

        assert_eq!(queue.pending_jobs().await, vec![DeliveryJob::unfollow(FEED, "admin")]);
    }

    #[tokio::test]
    async fn repeated_enqueue_is_a_no_op() {
        let queue = DeliveryQueue::new();
        queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap();

        assert_eq!(
            queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn like_and_follow_on_same_feed_do_not_interfere() {
        let queue = DeliveryQueue::new();
        let post = "https://mastodon.example/users/alice/statuses/1";

        queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap();
        queue.enqueue(DeliveryJob::like(FEED, post, "admin")).await.unwrap();
        queue.enqueue(DeliveryJob::unlike(FEED, post, "admin")).await.unwrap();

        assert!(queue.is_pending(&DeliveryJob::follow(FEED, "admin")).await);
        assert!(queue.is_pending(&DeliveryJob::unlike(FEED, post, "admin")).await);
        assert!(!queue.is_pending(&DeliveryJob::like(FEED, post, "admin")).await);
    }

    #[tokio::test]
    async fn announce_is_not_queued() {
        let queue = DeliveryQueue::new();
        let job = DeliveryJob {
            verb: Verb::Announce,
            feed_url: FEED.to_string(),
            object: None,
            acting_user: "admin".to_string(),
        };
        assert!(matches!(queue.enqueue(job).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn workers_skip_cancelled_jobs() {
        let queue = Arc::new(DeliveryQueue::new());
        queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap();
        queue.enqueue(DeliveryJob::unfollow(FEED, "admin")).await.unwrap();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut runner = MockJobRunner::new();
        runner
            .expect_run()
            .withf(|job| job.verb == Verb::Unfollow)
            .times(1)
            .returning(move |job| {
                let _ = done_tx.send(job.verb);
                delivered(&job)
            });

        let workers = queue.spawn_workers(Arc::new(runner), 2);

        let verb = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(verb, Some(Verb::Unfollow));
        assert_eq!(queue.pending_count().await, 0);

        for worker in workers {
            worker.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opposing_enqueues_leave_one_survivor() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = Arc::new(DeliveryQueue::new());

        let racers: Vec<_> = (0..64)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let job = if i % 2 == 0 {
                        DeliveryJob::follow(FEED, "admin")
                    } else {
                        DeliveryJob::unfollow(FEED, "admin")
                    };
                    queue.enqueue(job).await.unwrap()
                })
            })
            .collect();
        for racer in futures::future::join_all(racers).await {
            racer.unwrap();
        }

        let survivors = queue.pending_jobs().await;
        assert_eq!(survivors.len(), 1);
        let survivor = survivors[0].clone();

        let runs = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut runner = MockJobRunner::new();
        let counter = runs.clone();
        runner.expect_run().returning(move |job| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(job.clone());
            delivered(&job)
        });

        let workers = queue.spawn_workers(Arc::new(runner), 4);

        let ran = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap();
        assert_eq!(ran, Some(survivor));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count().await, 0);

        for worker in workers {
            worker.abort();
        }
    }

    #[tokio::test]
    async fn reserved_job_is_not_run_before_dispatch() {
        let queue = Arc::new(DeliveryQueue::new());
        let reservation = queue
            .reserve(DeliveryJob::follow(FEED, "admin"))
            .await
            .unwrap()
            .unwrap();

        assert!(queue.is_pending(&DeliveryJob::follow(FEED, "admin")).await);
        assert!(
            queue
                .reserve(DeliveryJob::follow(FEED, "admin"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), queue.next_job())
                .await
                .is_err()
        );

        queue.dispatch(reservation).await.unwrap();
        assert_eq!(
            queue.next_job().await,
            Some(DeliveryJob::follow(FEED, "admin"))
        );
    }

    #[tokio::test]
    async fn job_can_be_requeued_after_it_was_claimed() {
        let queue = DeliveryQueue::new();
        queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap();

        let claimed = queue.next_job().await.unwrap();
        assert_eq!(claimed, DeliveryJob::follow(FEED, "admin"));

        // In flight, so the same job may be queued again.
        assert_eq!(
            queue.enqueue(DeliveryJob::follow(FEED, "admin")).await.unwrap(),
            EnqueueOutcome::Queued
        );
    }
}
