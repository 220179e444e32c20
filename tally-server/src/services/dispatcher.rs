use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use tally_metrics::MetricBatch;
use tally_system::{Addr, AsyncResponse, FromMessage, Interface, Receiver, Sender, Service};

use crate::services::sender::{Enqueue, EnqueueError, OutcomeEvent, RetryingSender};
use crate::services::status::{BatchOutcome, StatusTracker};

/// An error accepting a batch into the pipeline.
///
/// Surfaced when at least one sender could not durably enqueue the batch; the
/// aggregator keeps the source reports and retries with a later window.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A sender failed to persist the batch on its queue.
    #[error("endpoint {endpoint:?} failed to enqueue the batch")]
    Enqueue {
        /// Name of the failing endpoint.
        endpoint: String,
        /// The underlying enqueue error.
        #[source]
        source: EnqueueError,
    },

    /// A sender stopped and can no longer take batches.
    #[error("endpoint {0:?} is no longer running")]
    SenderGone(String),
}

/// Fans a batch out to every sender and awaits durable enqueue everywhere.
#[derive(Debug)]
pub struct DispatchBatch(pub Arc<MetricBatch>);

/// Service interface for the [`DispatchBatch`] message.
#[derive(Debug)]
pub struct Dispatcher(pub DispatchBatch, pub Sender<Result<(), DispatchError>>);

impl Interface for Dispatcher {}

impl FromMessage<DispatchBatch> for Dispatcher {
    type Response = AsyncResponse<Result<(), DispatchError>>;

    fn from_message(message: DispatchBatch, sender: Sender<Result<(), DispatchError>>) -> Self {
        Self(message, sender)
    }
}

/// Join state for one in-flight batch.
#[derive(Debug)]
struct PendingBatch {
    expected: usize,
    completed: usize,
    failures: usize,
    completed_at: Option<DateTime<Utc>>,
}

struct Inner {
    senders: Vec<(String, Addr<RetryingSender>)>,
    status: Addr<StatusTracker>,
    pending: HashMap<String, PendingBatch>,
}

impl Inner {
    /// Enqueues the batch everywhere; `Ok` means every queue is durable.
    async fn dispatch(&mut self, batch: Arc<MetricBatch>) -> Result<(), DispatchError> {
        self.pending.insert(
            batch.id.clone(),
            PendingBatch {
                expected: self.senders.len(),
                completed: 0,
                failures: 0,
                completed_at: None,
            },
        );

        // Fire all enqueues before awaiting any of them.
        let requests: Vec<_> = self
            .senders
            .iter()
            .map(|(name, addr)| (name.clone(), addr.send(Enqueue(batch.clone()))))
            .collect();

        let mut result = Ok(());
        for (endpoint, request) in requests {
            let failure = match request.await {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(DispatchError::Enqueue {
                    endpoint: endpoint.clone(),
                    source,
                }),
                Err(_) => Some(DispatchError::SenderGone(endpoint.clone())),
            };

            if let Some(error) = failure {
                // This sender never saw the batch; no outcome will arrive from
                // it. Count the miss so the join still completes.
                if let Some(entry) = self.pending.get_mut(&batch.id) {
                    entry.completed += 1;
                    entry.failures += 1;
                }

                if result.is_ok() {
                    result = Err(error);
                } else {
                    tally_log::error!(endpoint = %endpoint, %error, "batch enqueue failed");
                }
            }
        }

        self.try_publish(&batch.id);
        result
    }

    /// Folds a terminal sender outcome into the batch's join state.
    fn complete(&mut self, event: OutcomeEvent) {
        let Some(entry) = self.pending.get_mut(&event.batch_id) else {
            // Outcome for a batch enqueued by a previous process: the join
            // table did not survive the restart, so publish it stand-alone.
            self.status.send(BatchOutcome {
                batch_id: event.batch_id,
                success: event.success,
                completed_at: event.completed_at,
            });
            return;
        };

        entry.completed += 1;
        if !event.success {
            entry.failures += 1;
        }
        entry.completed_at = Some(
            entry
                .completed_at
                .map_or(event.completed_at, |prev| prev.max(event.completed_at)),
        );

        self.try_publish(&event.batch_id);
    }

    fn try_publish(&mut self, batch_id: &str) {
        let done = self
            .pending
            .get(batch_id)
            .is_some_and(|entry| entry.completed >= entry.expected);
        if !done {
            return;
        }

        let entry = self.pending.remove(batch_id).expect("pending entry exists");
        let success = entry.failures == 0;
        tally_log::info!(batch = %batch_id, success, "batch reached a terminal state everywhere");

        self.status.send(BatchOutcome {
            batch_id: batch_id.to_owned(),
            success,
            completed_at: entry.completed_at.unwrap_or_else(Utc::now),
        });
    }
}

/// Stateless fan-out of batches to the configured senders.
///
/// Durable enqueue and terminal delivery are two distinct events: the response
/// to [`DispatchBatch`] only certifies that every sender persisted the batch,
/// which is what gates the aggregator. Terminal outcomes trickle in through
/// the senders' outcome channel and are joined here; once every sender
/// reported, the overall result goes to the [`StatusTracker`]. The outcome
/// channel also breaks the reference cycle between dispatcher and senders.
pub struct DispatcherService {
    senders: Vec<(String, Addr<RetryingSender>)>,
    status: Addr<StatusTracker>,
    outcomes: mpsc::UnboundedReceiver<OutcomeEvent>,
}

impl DispatcherService {
    /// Creates the dispatcher over the given senders.
    pub fn new(
        senders: Vec<(String, Addr<RetryingSender>)>,
        status: Addr<StatusTracker>,
        outcomes: mpsc::UnboundedReceiver<OutcomeEvent>,
    ) -> Self {
        Self {
            senders,
            status,
            outcomes,
        }
    }
}

impl Service for DispatcherService {
    type Interface = Dispatcher;

    fn spawn_handler(self, mut rx: Receiver<Self::Interface>) {
        let Self {
            senders,
            status,
            mut outcomes,
        } = self;

        let mut inner = Inner {
            senders,
            status,
            pending: HashMap::new(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    Some(event) = outcomes.recv() => inner.complete(event),
                    Some(Dispatcher(DispatchBatch(batch), sender)) = rx.recv() => {
                        sender.send(inner.dispatch(batch).await);
                    }

                    else => break,
                }
            }
        });
    }
}
