use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use tally_metrics::{
    AcceptError, Aggregator as MetricAggregator, AggregatorState, MetricBatch, MetricReport,
    MetricSchema,
};
use tally_system::{
    Addr, AsyncResponse, Controller, FromMessage, Interface, Receiver, Sender, Service,
};

use crate::persistence::{Persistence, PersistenceError};
use crate::services::dispatcher::{DispatchBatch, Dispatcher};

/// Persistence key of the aggregator snapshot.
const AGGREGATOR_KEY: &str = "aggregator";

/// How often elapsed windows are checked.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// An error accepting a report into the pipeline.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The aggregator rejected the report.
    #[error(transparent)]
    Rejected(#[from] AcceptError),

    /// The report was valid but could not be made durable.
    ///
    /// The in-memory state is rolled back, so the client can safely retry the
    /// identical report.
    #[error("failed to persist aggregator state")]
    Persistence(#[from] PersistenceError),
}

/// Submits one report to the aggregator.
#[derive(Debug)]
pub struct AcceptReport(pub MetricReport);

/// Forces an immediate window close for all buckets.
///
/// Responds once every popped report is durably enqueued at all senders (or
/// has been merged back after a dispatch failure). Used for the final flush on
/// shutdown.
#[derive(Debug)]
pub struct ForceFlush;

/// Returns the number of in-progress buckets.
#[cfg(test)]
#[derive(Debug)]
pub struct BucketCountInquiry;

/// Aggregator service interface.
#[derive(Debug)]
pub enum Aggregator {
    /// Accept a report into the current window.
    Accept(AcceptReport, Sender<Result<(), ReportError>>),
    /// Close all windows now.
    ForceFlush(ForceFlush, Sender<()>),
    /// Test-only bucket count probe.
    #[cfg(test)]
    BucketCountInquiry(BucketCountInquiry, Sender<usize>),
}

impl Interface for Aggregator {}

impl FromMessage<AcceptReport> for Aggregator {
    type Response = AsyncResponse<Result<(), ReportError>>;

    fn from_message(message: AcceptReport, sender: Sender<Result<(), ReportError>>) -> Self {
        Self::Accept(message, sender)
    }
}

impl FromMessage<ForceFlush> for Aggregator {
    type Response = AsyncResponse<()>;

    fn from_message(message: ForceFlush, sender: Sender<()>) -> Self {
        Self::ForceFlush(message, sender)
    }
}

#[cfg(test)]
impl FromMessage<BucketCountInquiry> for Aggregator {
    type Response = AsyncResponse<usize>;

    fn from_message(message: BucketCountInquiry, sender: Sender<usize>) -> Self {
        Self::BucketCountInquiry(message, sender)
    }
}

/// Service driving the [`MetricAggregator`].
///
/// All accepts and window closes run through this service's message loop,
/// which is the single serialization point the no-overlap invariant needs.
/// The snapshot is persisted after every successful accept *before* the client
/// sees a success, making ingestion idempotent across crashes: a client that
/// never got a response retries the same range and the watermark check
/// discards the duplicate.
///
/// A window close pops all elapsed buckets into a batch, hands it to the
/// dispatcher and awaits the durable-enqueue acknowledgement. Only then is the
/// post-flush state persisted. If any sender fails to enqueue, the reports are
/// merged back and a later tick retries; the watermarks never move backwards,
/// so ingestion stays consistent either way.
pub struct AggregatorService {
    aggregator: MetricAggregator,
    last_durable: AggregatorState,
    persistence: Persistence,
    dispatcher: Addr<Dispatcher>,
}

impl AggregatorService {
    /// Restores the aggregator from its persisted snapshot.
    pub async fn restore(
        schema: MetricSchema,
        persistence: Persistence,
        dispatcher: Addr<Dispatcher>,
    ) -> Result<Self, PersistenceError> {
        let state: AggregatorState = persistence
            .load_json(AGGREGATOR_KEY)
            .await?
            .unwrap_or_default();

        let mut aggregator = MetricAggregator::new(schema);
        aggregator.restore(state.clone());

        if aggregator.bucket_count() > 0 {
            tally_log::info!(
                buckets = aggregator.bucket_count(),
                "restored aggregation buckets from a previous run"
            );
        }

        Ok(Self {
            aggregator,
            last_durable: state,
            persistence,
            dispatcher,
        })
    }

    async fn persist(&mut self) -> Result<(), PersistenceError> {
        let state = self.aggregator.snapshot();
        self.persistence.store_json(AGGREGATOR_KEY, &state).await?;
        self.last_durable = state;
        Ok(())
    }

    async fn handle_accept(&mut self, report: MetricReport) -> Result<(), ReportError> {
        self.aggregator.accept(report, Utc::now())?;

        if let Err(error) = self.persist().await {
            // Roll back to the last durable state; the client retries the
            // identical report against unchanged watermarks.
            self.aggregator.restore(self.last_durable.clone());
            return Err(error.into());
        }

        Ok(())
    }

    async fn flush(&mut self, force: bool) {
        let now = Utc::now();
        let reports = self.aggregator.pop_flush(now, force);
        if reports.is_empty() {
            return;
        }

        let batch = Arc::new(MetricBatch::new(reports));
        match self.dispatcher.send(DispatchBatch(batch.clone())).await {
            Ok(Ok(())) => {
                tally_log::info!(
                    batch = %batch.id,
                    reports = batch.reports.len(),
                    "usage batch accepted into the pipeline"
                );
                if let Err(error) = self.persist().await {
                    // The batch is durable at every sender; losing this write
                    // means the reports may be re-dispatched after a crash,
                    // which dedup ids at the endpoints absorb.
                    tally_log::warn!(%error, "failed to persist state after flush");
                }
            }
            Ok(Err(error)) => {
                tally_log::warn!(%error, "batch not durably enqueued; retaining reports");
                self.aggregator.merge_back(batch.reports.clone(), now);
            }
            Err(_) => {
                tally_log::warn!("dispatcher stopped; retaining reports");
                self.aggregator.merge_back(batch.reports.clone(), now);
            }
        }
    }

    async fn handle_message(&mut self, message: Aggregator) {
        match message {
            Aggregator::Accept(AcceptReport(report), sender) => {
                sender.send(self.handle_accept(report).await)
            }
            Aggregator::ForceFlush(_, sender) => {
                self.flush(true).await;
                sender.send(());
            }
            #[cfg(test)]
            Aggregator::BucketCountInquiry(_, sender) => {
                sender.send(self.aggregator.bucket_count())
            }
        }
    }
}

impl Drop for AggregatorService {
    fn drop(&mut self) {
        let remaining = self.aggregator.bucket_count();
        if remaining > 0 {
            tally_log::error!(buckets = remaining, "aggregator dropping unflushed buckets");
        }
    }
}

impl Service for AggregatorService {
    type Interface = Aggregator;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    _ = ticker.tick() => self.flush(false).await,
                    Some(message) = rx.recv() => self.handle_message(message).await,
                    _ = shutdown.notified() => {
                        // Final window close; queues are durable, workers may
                        // stop without draining.
                        self.flush(true).await;
                        break;
                    }

                    else => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use similar_asserts::assert_eq;
    use tally_metrics::{MetricSpec, MetricValue, ValueKind};
    use tokio::sync::mpsc;

    use super::*;
    use crate::services::dispatcher::DispatchError;
    use crate::services::sender::EnqueueError;

    fn schema(buffer_secs: i64) -> MetricSchema {
        MetricSchema::from_iter([(
            "requests".to_owned(),
            MetricSpec {
                kind: ValueKind::Int64,
                buffer: ChronoDuration::seconds(buffer_secs),
            },
        )])
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn report(value: i64, start: i64, end: i64) -> MetricReport {
        MetricReport {
            name: "requests".to_owned(),
            value: MetricValue::Int64Value(value),
            start_time: ts(start),
            end_time: ts(end),
            labels: BTreeMap::new(),
        }
    }

    /// A dispatcher stub that acknowledges according to `accept` and forwards
    /// every received batch for inspection.
    fn fake_dispatcher(accept: bool) -> (Addr<Dispatcher>, mpsc::UnboundedReceiver<Arc<MetricBatch>>) {
        let (addr, mut rx) = Addr::<Dispatcher>::custom();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(Dispatcher(DispatchBatch(batch), sender)) = rx.recv().await {
                batch_tx.send(batch.clone()).ok();
                if accept {
                    sender.send(Ok(()));
                } else {
                    sender.send(Err(DispatchError::Enqueue {
                        endpoint: "a".to_owned(),
                        source: EnqueueError::Persistence(PersistenceError::Write {
                            key: "sender/a".to_owned(),
                            source: std::io::Error::other("disk full"),
                        }),
                    }));
                }
            }
        });

        (addr, batch_rx)
    }

    async fn start_service(
        buffer_secs: i64,
        persistence: Persistence,
        accept: bool,
    ) -> (Addr<Aggregator>, mpsc::UnboundedReceiver<Arc<MetricBatch>>) {
        let (dispatcher, batches) = fake_dispatcher(accept);
        let service = AggregatorService::restore(schema(buffer_secs), persistence, dispatcher)
            .await
            .unwrap();
        (service.start(), batches)
    }

    #[tokio::test]
    async fn test_accept_and_flush() {
        let persistence = Persistence::memory();
        let (addr, mut batches) = start_service(3600, persistence.clone(), true).await;

        addr.send(AcceptReport(report(5, 0, 10))).await.unwrap().unwrap();
        addr.send(AcceptReport(report(7, 10, 20))).await.unwrap().unwrap();

        addr.send(ForceFlush).await.unwrap();

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.reports, vec![report(12, 0, 20)]);

        // The post-flush snapshot keeps the watermark but no buckets.
        let state: AggregatorState = persistence
            .load_json("aggregator")
            .await
            .unwrap()
            .unwrap();
        assert!(state.buckets.is_empty());
        assert_eq!(state.watermarks.len(), 1);
        assert_eq!(state.watermarks[0].end_time, ts(20));
    }

    #[tokio::test]
    async fn test_rejections_map_to_accept_errors() {
        let (addr, _batches) = start_service(3600, Persistence::memory(), true).await;

        addr.send(AcceptReport(report(5, 0, 20))).await.unwrap().unwrap();

        let error = addr
            .send(AcceptReport(report(3, 10, 30)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            error,
            ReportError::Rejected(AcceptError::OverlappingWindow { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_elapsed_buckets() {
        // Zero buffer: the bucket is due at the next tick.
        let (addr, mut batches) = start_service(0, Persistence::memory(), true).await;

        addr.send(AcceptReport(report(5, 0, 10))).await.unwrap().unwrap();

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.reports, vec![report(5, 0, 10)]);

        let buckets = addr.send(BucketCountInquiry).await.unwrap();
        assert_eq!(buckets, 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_retains_reports() {
        let persistence = Persistence::memory();
        let (addr, mut batches) = start_service(3600, persistence.clone(), false).await;

        addr.send(AcceptReport(report(5, 0, 10))).await.unwrap().unwrap();
        addr.send(ForceFlush).await.unwrap();

        // The dispatcher saw the batch but did not accept it.
        let first = batches.recv().await.unwrap();
        assert_eq!(first.reports, vec![report(5, 0, 10)]);
        assert_eq!(addr.send(BucketCountInquiry).await.unwrap(), 1);

        // A later report merges into the retained bucket; the next flush
        // carries a fresh batch id for the combined aggregate.
        addr.send(AcceptReport(report(2, 10, 20))).await.unwrap().unwrap();
        addr.send(ForceFlush).await.unwrap();

        let second = batches.recv().await.unwrap();
        assert_eq!(second.reports, vec![report(7, 0, 20)]);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_recovery_after_restart() {
        let persistence = Persistence::memory();

        {
            let (addr, _batches) = start_service(3600, persistence.clone(), true).await;
            addr.send(AcceptReport(report(5, 0, 10))).await.unwrap().unwrap();
        }

        // A fresh process over the same persisted state.
        let (addr, mut batches) = start_service(3600, persistence.clone(), true).await;

        // The client retry of an already accepted range is discarded.
        let error = addr
            .send(AcceptReport(report(5, 0, 10)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            error,
            ReportError::Rejected(AcceptError::OverlappingWindow { .. })
        ));

        // Exactly one aggregate covering the range survives.
        addr.send(ForceFlush).await.unwrap();
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.reports, vec![report(5, 0, 10)]);
    }

    #[tokio::test]
    async fn test_persistence_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::disk(dir.path()).unwrap();
        let (addr, _batches) = start_service(3600, persistence.clone(), true).await;

        // Block the snapshot file with a directory of the same name.
        std::fs::create_dir(dir.path().join("aggregator.json")).unwrap();

        let error = addr
            .send(AcceptReport(report(5, 0, 10)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(error, ReportError::Persistence(_)));

        // After the write path recovers, the identical retry is accepted:
        // the failed accept left no watermark behind.
        std::fs::remove_dir(dir.path().join("aggregator.json")).unwrap();
        addr.send(AcceptReport(report(5, 0, 10))).await.unwrap().unwrap();
        assert_eq!(addr.send(BucketCountInquiry).await.unwrap(), 1);
    }
}
