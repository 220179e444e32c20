use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};

use tally_common::retry::RetryBackoff;
use tally_common::time::{duration_until, to_chrono_duration};
use tally_config::RetryConfig;
use tally_endpoints::{Endpoint, EndpointReport};
use tally_metrics::MetricBatch;
use tally_system::{AsyncResponse, Controller, FromMessage, Interface, Receiver, Sender, Service};

use crate::persistence::{Persistence, PersistenceError};

/// An error while durably enqueueing a batch.
///
/// The batch was *not* accepted by this sender; the dispatcher surfaces this
/// to the aggregator, which keeps the source reports.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Writing the queue to persistence failed.
    #[error("failed to persist the send queue")]
    Persistence(#[from] PersistenceError),
}

/// One queued report with its retry bookkeeping.
///
/// Timestamps are wall-clock so that a restart resumes the exact schedule
/// instead of retrying everything at once.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// The endpoint-specific report, dedup id included.
    pub report: EndpointReport,
    /// When the entry was first enqueued.
    pub first_attempt: DateTime<Utc>,
    /// When the next delivery attempt is due.
    pub next_attempt: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub failure_count: u32,
}

/// A terminal delivery outcome, consumed by the dispatcher.
#[derive(Debug)]
pub struct OutcomeEvent {
    /// Name of the reporting endpoint.
    pub endpoint: String,
    /// The batch that reached a terminal state.
    pub batch_id: String,
    /// `true` for a delivered batch, `false` for a dead one.
    pub success: bool,
    /// When the terminal state was reached.
    pub completed_at: DateTime<Utc>,
}

/// Durably enqueues a batch on the sender's queue.
#[derive(Debug)]
pub struct Enqueue(pub Arc<MetricBatch>);

/// Service interface for the [`Enqueue`] message.
#[derive(Debug)]
pub struct RetryingSender(pub Enqueue, pub Sender<Result<(), EnqueueError>>);

impl Interface for RetryingSender {}

impl FromMessage<Enqueue> for RetryingSender {
    type Response = AsyncResponse<Result<(), EnqueueError>>;

    fn from_message(message: Enqueue, sender: Sender<Result<(), EnqueueError>>) -> Self {
        Self(message, sender)
    }
}

/// The durable FIFO queue shared between the enqueue path and the worker.
#[derive(Debug)]
struct SendQueue {
    key: String,
    entries: VecDeque<QueueEntry>,
    persistence: Persistence,
}

impl SendQueue {
    async fn persist(&self) -> Result<(), PersistenceError> {
        self.persistence.store_json(&self.key, &self.entries).await
    }
}

/// Service wrapping one [`Endpoint`] with a durable retry queue.
///
/// `Enqueue` builds the endpoint report, appends it to the queue and responds
/// once the queue hit persistence. A single worker drains the queue strictly
/// head-first: it waits for the head's `next_attempt`, calls the endpoint
/// without holding the queue lock, and reschedules the head with exponential
/// backoff on transient failures. An entry leaves the queue on success, on a
/// permanent failure, or once it exhausts `max_attempts`/`max_lifetime`; each
/// departure emits exactly one [`OutcomeEvent`].
#[derive(Debug)]
pub struct RetryingSenderService {
    endpoint: Arc<dyn Endpoint>,
    queue: Arc<Mutex<SendQueue>>,
    notify: Arc<Notify>,
    outcome_tx: mpsc::UnboundedSender<OutcomeEvent>,
    backoff: RetryBackoff,
    max_attempts: u32,
    max_lifetime: Duration,
}

impl RetryingSenderService {
    /// Restores the sender for an endpoint, reloading its persisted queue.
    ///
    /// `next_attempt` deadlines survive as persisted, which prevents a
    /// thundering herd of retries right after a restart.
    pub async fn restore(
        endpoint: Arc<dyn Endpoint>,
        persistence: Persistence,
        retry: &RetryConfig,
        outcome_tx: mpsc::UnboundedSender<OutcomeEvent>,
    ) -> Result<Self, PersistenceError> {
        let key = format!("sender/{}", endpoint.name());
        let entries: VecDeque<QueueEntry> =
            persistence.load_json(&key).await?.unwrap_or_default();

        if !entries.is_empty() {
            tally_log::info!(
                endpoint = %endpoint.name(),
                queued = entries.len(),
                "restored queued reports from a previous run"
            );
        }

        Ok(Self {
            endpoint,
            queue: Arc::new(Mutex::new(SendQueue {
                key,
                entries,
                persistence,
            })),
            notify: Arc::new(Notify::new()),
            outcome_tx,
            backoff: RetryBackoff::new(retry.params()),
            max_attempts: retry.max_attempts,
            max_lifetime: retry.max_lifetime(),
        })
    }

    fn emit_outcome(&self, batch_id: &str, success: bool) {
        self.outcome_tx
            .send(OutcomeEvent {
                endpoint: self.endpoint.name().to_owned(),
                batch_id: batch_id.to_owned(),
                success,
                completed_at: Utc::now(),
            })
            .ok();
    }

    async fn handle_enqueue(&self, batch: Arc<MetricBatch>) -> Result<(), EnqueueError> {
        let report = match self.endpoint.build_report(&batch) {
            Ok(report) => report,
            Err(error) => {
                // A batch that cannot even be encoded will not get better on
                // retry; count it as an immediate permanent failure.
                tally_log::error!(
                    endpoint = %self.endpoint.name(),
                    batch = %batch.id,
                    %error,
                    "failed to build endpoint report"
                );
                self.emit_outcome(&batch.id, false);
                return Ok(());
            }
        };

        let now = Utc::now();
        let entry = QueueEntry {
            report,
            first_attempt: now,
            next_attempt: now,
            failure_count: 0,
        };

        let mut queue = self.queue.lock().await;
        queue.entries.push_back(entry);
        if let Err(error) = queue.persist().await {
            queue.entries.pop_back();
            return Err(error.into());
        }
        drop(queue);

        self.notify.notify_one();
        Ok(())
    }

    /// Removes the head entry and reports its terminal outcome.
    async fn finish_head(&self, entry: &QueueEntry, success: bool) {
        let mut queue = self.queue.lock().await;
        queue.entries.pop_front();
        if let Err(error) = queue.persist().await {
            tally_log::warn!(endpoint = %self.endpoint.name(), %error, "failed to persist queue removal");
        }
        drop(queue);

        self.emit_outcome(&entry.report.batch_id, success);
    }

    /// Reschedules the head entry after a transient failure.
    async fn reschedule_head(&self, failure_count: u32, next_attempt: DateTime<Utc>) {
        let mut queue = self.queue.lock().await;
        if let Some(head) = queue.entries.front_mut() {
            head.failure_count = failure_count;
            head.next_attempt = next_attempt;
        }
        if let Err(error) = queue.persist().await {
            tally_log::warn!(endpoint = %self.endpoint.name(), %error, "failed to persist retry schedule");
        }
    }

    async fn attempt(&self, entry: &QueueEntry) {
        match self.endpoint.send(&entry.report).await {
            Ok(()) => {
                tally_log::debug!(
                    endpoint = %self.endpoint.name(),
                    batch = %entry.report.batch_id,
                    "report delivered"
                );
                self.finish_head(entry, true).await;
            }
            Err(error) if error.is_permanent() => {
                tally_log::error!(
                    endpoint = %self.endpoint.name(),
                    batch = %entry.report.batch_id,
                    %error,
                    "report rejected; dropping it"
                );
                self.finish_head(entry, false).await;
            }
            Err(error) => {
                let now = Utc::now();
                let failure_count = entry.failure_count + 1;
                let age = (now - entry.first_attempt).to_std().unwrap_or_default();

                if failure_count >= self.max_attempts || age >= self.max_lifetime {
                    tally_log::warn!(
                        endpoint = %self.endpoint.name(),
                        batch = %entry.report.batch_id,
                        attempts = failure_count,
                        %error,
                        "giving up on report"
                    );
                    self.finish_head(entry, false).await;
                } else {
                    let delay = self.backoff.delay(failure_count);
                    tally_log::warn!(
                        endpoint = %self.endpoint.name(),
                        batch = %entry.report.batch_id,
                        attempts = failure_count,
                        retry_in = ?delay,
                        %error,
                        "report delivery failed"
                    );
                    self.reschedule_head(failure_count, now + to_chrono_duration(delay))
                        .await;
                }
            }
        }
    }

    /// Drains the queue head-first until shutdown.
    async fn work(&self) {
        let mut shutdown = Controller::shutdown_handle();

        loop {
            let head = { self.queue.lock().await.entries.front().cloned() };

            let entry = match head {
                Some(entry) => entry,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.notified() => break,
                    }
                    continue;
                }
            };

            let wait = duration_until(entry.next_attempt);
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.notified() => break,
                }
            }

            // The send happens without the queue lock; an in-flight attempt is
            // abandoned on shutdown and the entry stays at the head for the
            // next process.
            tokio::select! {
                _ = self.attempt(&entry) => {}
                _ = shutdown.notified() => break,
            }
        }
    }
}

impl Service for RetryingSenderService {
    type Interface = RetryingSender;

    fn spawn_handler(self, mut rx: Receiver<Self::Interface>) {
        let service = Arc::new(self);

        let worker = service.clone();
        tokio::spawn(async move { worker.work().await });

        tokio::spawn(async move {
            while let Some(RetryingSender(Enqueue(batch), sender)) = rx.recv().await {
                sender.send(service.handle_enqueue(batch).await);
            }
        });
    }
}
