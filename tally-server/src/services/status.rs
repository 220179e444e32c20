use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service};

/// The process-wide delivery status served by `GET /status`.
///
/// The counters are since-restart: the tracker is the only pipeline component
/// that intentionally does not persist its state, since everything here is
/// re-derivable from future batch outcomes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Completion time of the most recent fully successful batch.
    pub last_report_success: Option<DateTime<Utc>>,
    /// Failed batches since the last fully successful one.
    pub current_failure_count: u64,
    /// Failed batches since the process started.
    pub total_failure_count: u64,
}

/// The terminal outcome of one batch across all endpoints.
#[derive(Debug)]
pub struct BatchOutcome {
    /// The batch this outcome belongs to.
    pub batch_id: String,
    /// `true` if every endpoint delivered the batch.
    pub success: bool,
    /// When the last endpoint reached its terminal state.
    pub completed_at: DateTime<Utc>,
}

/// Requests the current [`StatusSnapshot`].
#[derive(Debug)]
pub struct GetStatus;

/// Status tracker service interface.
#[derive(Debug)]
pub enum StatusTracker {
    /// Record a batch outcome reported by the dispatcher.
    Track(BatchOutcome),
    /// Read the current snapshot.
    Get(GetStatus, Sender<StatusSnapshot>),
}

impl Interface for StatusTracker {}

impl FromMessage<BatchOutcome> for StatusTracker {
    type Response = NoResponse;

    fn from_message(message: BatchOutcome, _: ()) -> Self {
        Self::Track(message)
    }
}

impl FromMessage<GetStatus> for StatusTracker {
    type Response = AsyncResponse<StatusSnapshot>;

    fn from_message(message: GetStatus, sender: Sender<StatusSnapshot>) -> Self {
        Self::Get(message, sender)
    }
}

/// Service implementing the [`StatusTracker`] interface.
///
/// Outcomes may arrive out of dispatch order when a later batch completes
/// before an earlier one; `last_report_success` therefore takes the maximum
/// completion time instead of the latest arrival.
#[derive(Debug, Default)]
pub struct StatusTrackerService {
    snapshot: StatusSnapshot,
}

impl StatusTrackerService {
    /// Creates the tracker with a clean snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_track(&mut self, outcome: BatchOutcome) {
        if outcome.success {
            let last = self
                .snapshot
                .last_report_success
                .map_or(outcome.completed_at, |prev| prev.max(outcome.completed_at));
            self.snapshot.last_report_success = Some(last);
            self.snapshot.current_failure_count = 0;
        } else {
            self.snapshot.current_failure_count += 1;
            self.snapshot.total_failure_count += 1;
        }

        tally_log::debug!(
            batch = %outcome.batch_id,
            success = outcome.success,
            current_failures = self.snapshot.current_failure_count,
            "tracked batch outcome"
        );
    }

    fn handle_message(&mut self, message: StatusTracker) {
        match message {
            StatusTracker::Track(outcome) => self.handle_track(outcome),
            StatusTracker::Get(_, sender) => sender.send(self.snapshot.clone()),
        }
    }
}

impl Service for StatusTrackerService {
    type Interface = StatusTracker;

    fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.handle_message(message);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn outcome(success: bool, completed: i64) -> BatchOutcome {
        BatchOutcome {
            batch_id: format!("batch-{completed}"),
            success,
            completed_at: ts(completed),
        }
    }

    #[test]
    fn test_failure_then_success_resets_current() {
        let mut service = StatusTrackerService::new();

        service.handle_track(outcome(false, 1));
        service.handle_track(outcome(false, 2));
        assert_eq!(
            service.snapshot,
            StatusSnapshot {
                last_report_success: None,
                current_failure_count: 2,
                total_failure_count: 2,
            }
        );

        service.handle_track(outcome(true, 3));
        assert_eq!(
            service.snapshot,
            StatusSnapshot {
                last_report_success: Some(ts(3)),
                current_failure_count: 0,
                total_failure_count: 2,
            }
        );
    }

    #[test]
    fn test_last_success_is_max_completion_time() {
        let mut service = StatusTrackerService::new();

        // A later batch completes first; the earlier one trails in.
        service.handle_track(outcome(true, 10));
        service.handle_track(outcome(true, 5));

        assert_eq!(service.snapshot.last_report_success, Some(ts(10)));
    }

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = StatusSnapshot {
            last_report_success: Some(ts(0)),
            current_failure_count: 1,
            total_failure_count: 2,
        };

        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            serde_json::json!({
                "lastReportSuccess": "2023-11-14T22:13:20Z",
                "currentFailureCount": 1,
                "totalFailureCount": 2
            })
        );

        let empty = StatusSnapshot::default();
        assert_eq!(
            serde_json::to_value(&empty).unwrap()["lastReportSuccess"],
            serde_json::Value::Null
        );
    }

    #[tokio::test]
    async fn test_service_roundtrip() {
        let addr = StatusTrackerService::new().start();

        addr.send(BatchOutcome {
            batch_id: "batch".to_owned(),
            success: false,
            completed_at: ts(0),
        });

        let snapshot = addr.send(GetStatus).await.unwrap();
        assert_eq!(snapshot.total_failure_count, 1);
    }
}
