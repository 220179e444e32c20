use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use tally_config::{HeartbeatConfig, SourceConfig, SourceKind};
use tally_metrics::MetricReport;
use tally_system::{Addr, Controller, Receiver, Service};

use crate::services::aggregator::{AcceptReport, Aggregator};

/// Service running the configured synthetic report sources.
///
/// Each heartbeat source feeds a constant report through the regular accept
/// path on its interval. A beat covers `[last successful beat, now]`, so
/// consecutive beats never trip the aggregator's no-overlap check.
pub struct HeartbeatService {
    sources: Vec<SourceConfig>,
    aggregator: Addr<Aggregator>,
}

impl HeartbeatService {
    /// Creates the service for the given sources.
    pub fn new(sources: Vec<SourceConfig>, aggregator: Addr<Aggregator>) -> Self {
        Self {
            sources,
            aggregator,
        }
    }
}

impl Service for HeartbeatService {
    type Interface = ();

    fn spawn_handler(self, _rx: Receiver<Self::Interface>) {
        for source in self.sources {
            let SourceKind::Heartbeat(heartbeat) = source.kind;
            tokio::spawn(beat(source.name, heartbeat, self.aggregator.clone()));
        }
    }
}

async fn beat(name: String, config: HeartbeatConfig, aggregator: Addr<Aggregator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick only starts the covered range.
    ticker.tick().await;

    let mut shutdown = Controller::shutdown_handle();
    let mut last_beat = Utc::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.notified() => break,
        }

        let now = Utc::now();
        let report = MetricReport {
            name: config.metric.clone(),
            value: config.value,
            start_time: last_beat,
            end_time: now,
            labels: config.labels.clone(),
        };

        match aggregator.send(AcceptReport(report)).await {
            Ok(Ok(())) => {
                last_beat = now;
                tally_log::debug!(source = %name, metric = %config.metric, "heartbeat emitted");
            }
            Ok(Err(error)) => {
                // Skipped beats extend the next covered range instead of
                // losing time: last_beat only advances on acceptance.
                tally_log::warn!(source = %name, %error, "heartbeat rejected");
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;
    use tally_metrics::MetricValue;
    use tokio::sync::mpsc;

    use super::*;

    fn source(interval_seconds: u64) -> SourceConfig {
        SourceConfig {
            name: "beat".to_owned(),
            kind: SourceKind::Heartbeat(HeartbeatConfig {
                metric: "instance_time".to_owned(),
                interval_seconds,
                value: MetricValue::Int64Value(60),
                labels: BTreeMap::from([("auto".to_owned(), "true".to_owned())]),
            }),
        }
    }

    /// Captures accepted reports and acknowledges each.
    fn capturing_aggregator() -> (Addr<Aggregator>, mpsc::UnboundedReceiver<MetricReport>) {
        let (addr, mut rx) = Addr::<Aggregator>::custom();
        let (tx, reports) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Aggregator::Accept(AcceptReport(report), sender) = message {
                    tx.send(report).ok();
                    sender.send(Ok(()));
                }
            }
        });

        (addr, reports)
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_cover_contiguous_ranges() {
        let (aggregator, mut reports) = capturing_aggregator();
        HeartbeatService::new(vec![source(60)], aggregator).start();

        let first = reports.recv().await.unwrap();
        let second = reports.recv().await.unwrap();

        assert_eq!(first.name, "instance_time");
        assert_eq!(first.value, MetricValue::Int64Value(60));
        assert_eq!(first.labels.get("auto").map(String::as_str), Some("true"));

        // The second beat starts exactly where the first ended.
        assert_eq!(second.start_time, first.end_time);
        assert!(first.end_time >= first.start_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_beat_extends_next_range() {
        let (addr, mut rx) = Addr::<Aggregator>::custom();
        let (tx, mut reports) = mpsc::unbounded_channel();

        // Reject the first beat, accept later ones.
        tokio::spawn(async move {
            let mut first = true;
            while let Some(message) = rx.recv().await {
                if let Aggregator::Accept(AcceptReport(report), sender) = message {
                    tx.send(report).ok();
                    if first {
                        first = false;
                        sender.send(Err(crate::services::aggregator::ReportError::Rejected(
                            tally_metrics::AcceptError::InvalidRange,
                        )));
                    } else {
                        sender.send(Ok(()));
                    }
                }
            }
        });

        HeartbeatService::new(vec![source(60)], addr).start();

        let first = reports.recv().await.unwrap();
        let second = reports.recv().await.unwrap();

        // The rejected beat's range is re-covered by the next one.
        assert_eq!(second.start_time, first.start_time);
    }
}
