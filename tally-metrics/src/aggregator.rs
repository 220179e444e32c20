use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::report::{MetricReport, ReportKey, ValueKind};

/// Any error that may occur while accepting a report.
///
/// Rejections never mutate aggregator state; a client that receives an error
/// can retry the identical report without double-counting.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AcceptError {
    /// The metric name is not part of the configured schema.
    #[error("unknown metric {0:?}")]
    UnknownMetric(String),

    /// The value kind differs from the kind configured for the metric.
    #[error("metric {metric:?} expects {expected} values, got {actual}")]
    KindMismatch {
        /// The metric name.
        metric: String,
        /// The kind declared in the schema.
        expected: ValueKind,
        /// The kind found on the report.
        actual: ValueKind,
    },

    /// The report overlaps a time range that was already accepted for its key.
    #[error("report starting at {start} overlaps an accepted report ending at {watermark}")]
    OverlappingWindow {
        /// Start time of the rejected report.
        start: DateTime<Utc>,
        /// End time of the latest accepted report for the same key.
        watermark: DateTime<Utc>,
    },

    /// The report's end time precedes its start time.
    #[error("report end time precedes its start time")]
    InvalidRange,

    /// Merging the report into its bucket would overflow the value range.
    #[error("aggregated value overflows the {0} range")]
    ValueOverflow(ValueKind),
}

/// Schema entry for a single configured metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricSpec {
    /// The value kind reports must carry.
    pub kind: ValueKind,
    /// The aggregation window for this metric.
    pub buffer: Duration,
}

/// The set of metrics the agent accepts, with their value kinds and windows.
#[derive(Clone, Debug, Default)]
pub struct MetricSchema {
    metrics: BTreeMap<String, MetricSpec>,
}

impl MetricSchema {
    /// Looks up the spec for a metric name.
    pub fn get(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.get(name)
    }

    /// Returns `true` if the schema declares the given metric.
    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }
}

impl FromIterator<(String, MetricSpec)> for MetricSchema {
    fn from_iter<I: IntoIterator<Item = (String, MetricSpec)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

/// An in-progress aggregate and the time at which it is due for flushing.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedReport {
    /// The wall-clock time at which this bucket's window closes.
    pub flush_at: DateTime<Utc>,
    /// The aggregate accumulated so far.
    pub report: MetricReport,
}

/// Watermark entry: the end time of the latest accepted report for a key.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    /// The bucket key.
    pub key: ReportKey,
    /// End time of the latest accepted report.
    pub end_time: DateTime<Utc>,
}

/// Serializable snapshot of the aggregator, persisted after every mutation.
///
/// Buckets and watermarks are sorted by key so that equal states serialize to
/// identical documents.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorState {
    /// In-progress buckets.
    pub buckets: Vec<QueuedReport>,
    /// Per-key time watermarks. These outlive their buckets.
    pub watermarks: Vec<Watermark>,
}

/// A collector of [`MetricReport`] submissions.
///
/// # Aggregation
///
/// Each report is merged into a bucket identified by its `(name, labels)` key.
/// Merging sums the values, widens the time range to the union, and keeps the
/// labels. A bucket flushes once its metric's aggregation window has elapsed
/// since the bucket was created.
///
/// # Time monotonicity
///
/// For every key, the aggregator tracks the end time of the latest accepted
/// report. A report whose start time lies before that watermark is rejected
/// with [`AcceptError::OverlappingWindow`]. This makes client retries safe:
/// a client that never saw a success response can repost the same time range,
/// and the duplicate is discarded instead of double-counted. Watermarks
/// survive flushes and restarts.
#[derive(Debug)]
pub struct Aggregator {
    schema: MetricSchema,
    buckets: HashMap<ReportKey, QueuedReport>,
    watermarks: HashMap<ReportKey, DateTime<Utc>>,
}

impl Aggregator {
    /// Creates an empty aggregator for the given schema.
    pub fn new(schema: MetricSchema) -> Self {
        Self {
            schema,
            buckets: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }

    /// Returns the number of in-progress buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns `true` if no buckets are in progress.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Validates and merges a report.
    ///
    /// On success the bucket for the report's key holds the combined aggregate
    /// and the key's watermark has advanced to the report's end time. On error
    /// no state has changed.
    pub fn accept(&mut self, report: MetricReport, now: DateTime<Utc>) -> Result<(), AcceptError> {
        let spec = self
            .schema
            .get(&report.name)
            .copied()
            .ok_or_else(|| AcceptError::UnknownMetric(report.name.clone()))?;

        let actual = report.value.kind();
        if actual != spec.kind {
            return Err(AcceptError::KindMismatch {
                metric: report.name.clone(),
                expected: spec.kind,
                actual,
            });
        }

        if report.end_time < report.start_time {
            return Err(AcceptError::InvalidRange);
        }

        let key = report.key();
        if let Some(&watermark) = self.watermarks.get(&key) {
            if report.start_time < watermark {
                return Err(AcceptError::OverlappingWindow {
                    start: report.start_time,
                    watermark,
                });
            }
        }

        let end_time = report.end_time;
        match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let aggregate = &mut entry.get_mut().report;
                let merged = aggregate
                    .value
                    .checked_add(report.value)
                    .ok_or(AcceptError::ValueOverflow(spec.kind))?;

                aggregate.value = merged;
                aggregate.start_time = aggregate.start_time.min(report.start_time);
                aggregate.end_time = aggregate.end_time.max(report.end_time);
            }
            Entry::Vacant(entry) => {
                entry.insert(QueuedReport {
                    flush_at: now + spec.buffer,
                    report,
                });
            }
        }

        let watermark = self.watermarks.entry(key).or_insert(end_time);
        *watermark = (*watermark).max(end_time);

        Ok(())
    }

    /// Removes and returns the aggregates of all elapsed buckets.
    ///
    /// With `force`, all buckets are returned regardless of their deadline
    /// (used for the final flush on shutdown). Watermarks are retained, so the
    /// no-overlap check keeps holding for reports arriving after the flush.
    /// The result is ordered by bucket key.
    pub fn pop_flush(&mut self, now: DateTime<Utc>, force: bool) -> Vec<MetricReport> {
        let elapsed: Vec<ReportKey> = self
            .buckets
            .iter()
            .filter(|(_, queued)| force || queued.flush_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut reports: Vec<MetricReport> = elapsed
            .iter()
            .filter_map(|key| self.buckets.remove(key))
            .map(|queued| queued.report)
            .collect();

        reports.sort_by(|a, b| a.key().cmp(&b.key()));
        reports
    }

    /// Restores reports that were popped but could not be dispatched.
    ///
    /// The reports re-enter their buckets under the closure rule and become due
    /// again after a full aggregation window. This is not a re-accept: the
    /// watermarks never moved past these reports, so no monotonicity check
    /// applies. Integer overflow saturates here because a popped report must
    /// not be droppable.
    pub fn merge_back(&mut self, reports: Vec<MetricReport>, now: DateTime<Utc>) {
        for report in reports {
            let buffer = self
                .schema
                .get(&report.name)
                .map(|spec| spec.buffer)
                .unwrap_or_else(Duration::zero);

            match self.buckets.entry(report.key()) {
                Entry::Occupied(mut entry) => {
                    let aggregate = &mut entry.get_mut().report;
                    if let Some(merged) = aggregate.value.saturating_add(report.value) {
                        aggregate.value = merged;
                    }
                    aggregate.start_time = aggregate.start_time.min(report.start_time);
                    aggregate.end_time = aggregate.end_time.max(report.end_time);
                }
                Entry::Vacant(entry) => {
                    entry.insert(QueuedReport {
                        flush_at: now + buffer,
                        report,
                    });
                }
            }
        }
    }

    /// Returns a serializable snapshot of buckets and watermarks.
    pub fn snapshot(&self) -> AggregatorState {
        let mut buckets: Vec<QueuedReport> = self.buckets.values().cloned().collect();
        buckets.sort_by(|a, b| a.report.key().cmp(&b.report.key()));

        let mut watermarks: Vec<Watermark> = self
            .watermarks
            .iter()
            .map(|(key, &end_time)| Watermark {
                key: key.clone(),
                end_time,
            })
            .collect();
        watermarks.sort_by(|a, b| a.key.cmp(&b.key));

        AggregatorState {
            buckets,
            watermarks,
        }
    }

    /// Replaces the aggregator contents with a previously taken snapshot.
    ///
    /// Buckets of metrics that are no longer configured are kept; they flush
    /// normally and leave through the pipeline.
    pub fn restore(&mut self, state: AggregatorState) {
        self.buckets = state
            .buckets
            .into_iter()
            .map(|queued| (queued.report.key(), queued))
            .collect();
        self.watermarks = state
            .watermarks
            .into_iter()
            .map(|watermark| (watermark.key, watermark.end_time))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::report::MetricValue;

    fn test_schema() -> MetricSchema {
        MetricSchema::from_iter([
            (
                "requests".to_owned(),
                MetricSpec {
                    kind: ValueKind::Int64,
                    buffer: Duration::seconds(10),
                },
            ),
            (
                "load".to_owned(),
                MetricSpec {
                    kind: ValueKind::Double,
                    buffer: Duration::seconds(2),
                },
            ),
        ])
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn int_report(name: &str, value: i64, start: i64, end: i64) -> MetricReport {
        MetricReport {
            name: name.to_owned(),
            value: MetricValue::Int64Value(value),
            start_time: ts(start),
            end_time: ts(end),
            labels: BTreeMap::new(),
        }
    }

    fn labeled(mut report: MetricReport, key: &str, value: &str) -> MetricReport {
        report.labels.insert(key.to_owned(), value.to_owned());
        report
    }

    #[test]
    fn test_accept_merges_adjacent_reports() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator.accept(int_report("requests", 5, 0, 10), ts(0)).unwrap();
        aggregator.accept(int_report("requests", 7, 10, 20), ts(0)).unwrap();

        assert_eq!(aggregator.bucket_count(), 1);
        let reports = aggregator.pop_flush(ts(60), false);
        assert_eq!(reports, vec![int_report("requests", 12, 0, 20)]);
    }

    #[test]
    fn test_label_split() {
        let mut aggregator = Aggregator::new(test_schema());

        let plain = int_report("requests", 1, 0, 10);
        let zoned = labeled(int_report("requests", 2, 0, 10), "zone", "a");
        aggregator.accept(plain.clone(), ts(0)).unwrap();
        aggregator.accept(zoned.clone(), ts(0)).unwrap();

        let reports = aggregator.pop_flush(ts(60), false);
        assert_eq!(reports, vec![plain, zoned]);
    }

    #[test]
    fn test_overlap_rejected_without_mutation() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator.accept(int_report("requests", 5, 0, 20), ts(0)).unwrap();

        let error = aggregator
            .accept(int_report("requests", 3, 10, 30), ts(0))
            .unwrap_err();
        assert_eq!(
            error,
            AcceptError::OverlappingWindow {
                start: ts(10),
                watermark: ts(20),
            }
        );

        // The rejection left the aggregate untouched.
        let reports = aggregator.pop_flush(ts(60), false);
        assert_eq!(reports, vec![int_report("requests", 5, 0, 20)]);
    }

    #[test]
    fn test_touching_ranges_accepted() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator.accept(int_report("requests", 5, 0, 10), ts(0)).unwrap();
        // A range starting exactly at the watermark does not overlap.
        aggregator.accept(int_report("requests", 5, 10, 10), ts(0)).unwrap();
    }

    #[test]
    fn test_unknown_metric() {
        let mut aggregator = Aggregator::new(test_schema());
        let error = aggregator
            .accept(int_report("cycles", 1, 0, 1), ts(0))
            .unwrap_err();
        assert_eq!(error, AcceptError::UnknownMetric("cycles".to_owned()));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut aggregator = Aggregator::new(test_schema());
        let mut report = int_report("load", 1, 0, 1);
        report.value = MetricValue::Int64Value(1);

        let error = aggregator.accept(report, ts(0)).unwrap_err();
        assert_eq!(
            error,
            AcceptError::KindMismatch {
                metric: "load".to_owned(),
                expected: ValueKind::Double,
                actual: ValueKind::Int64,
            }
        );
    }

    #[test]
    fn test_invalid_range() {
        let mut aggregator = Aggregator::new(test_schema());
        let error = aggregator
            .accept(int_report("requests", 1, 10, 5), ts(0))
            .unwrap_err();
        assert_eq!(error, AcceptError::InvalidRange);
    }

    #[test]
    fn test_value_overflow_rejected() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator
            .accept(int_report("requests", i64::MAX, 0, 10), ts(0))
            .unwrap();
        let error = aggregator
            .accept(int_report("requests", 1, 10, 20), ts(0))
            .unwrap_err();
        assert_eq!(error, AcceptError::ValueOverflow(ValueKind::Int64));

        // The watermark did not advance past the rejected report.
        aggregator.pop_flush(ts(60), false);
        let state = aggregator.snapshot();
        assert_eq!(state.watermarks[0].end_time, ts(10));
    }

    #[test]
    fn test_permutation_invariance() {
        // Same-key reports must stay chronological (the watermark enforces
        // that); across keys, arrival order must not matter.
        let a1 = labeled(int_report("requests", 1, 0, 5), "zone", "a");
        let a2 = labeled(int_report("requests", 2, 5, 10), "zone", "a");
        let b = labeled(int_report("requests", 4, 0, 10), "zone", "b");

        let aggregate = |order: Vec<MetricReport>| {
            let mut aggregator = Aggregator::new(test_schema());
            for report in order {
                aggregator.accept(report, ts(0)).unwrap();
            }
            aggregator.pop_flush(ts(60), false)
        };

        let expected = vec![
            labeled(int_report("requests", 3, 0, 10), "zone", "a"),
            b.clone(),
        ];

        assert_eq!(aggregate(vec![a1.clone(), a2.clone(), b.clone()]), expected);
        assert_eq!(aggregate(vec![b.clone(), a1.clone(), a2.clone()]), expected);
        assert_eq!(aggregate(vec![a1, b, a2]), expected);
    }

    #[test]
    fn test_watermark_survives_flush() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator.accept(int_report("requests", 5, 0, 20), ts(0)).unwrap();
        let flushed = aggregator.pop_flush(ts(60), false);
        assert_eq!(flushed.len(), 1);

        // Retrying the flushed range is still rejected.
        let error = aggregator
            .accept(int_report("requests", 5, 0, 20), ts(60))
            .unwrap_err();
        assert!(matches!(error, AcceptError::OverlappingWindow { .. }));
    }

    #[test]
    fn test_pop_flush_respects_deadlines() {
        let mut aggregator = Aggregator::new(test_schema());

        // "requests" buffers for 10s, "load" for 2s.
        aggregator.accept(int_report("requests", 1, 0, 1), ts(0)).unwrap();
        let mut load = int_report("load", 0, 0, 1);
        load.value = MetricValue::DoubleValue(0.5);
        aggregator.accept(load.clone(), ts(0)).unwrap();

        let early = aggregator.pop_flush(ts(5), false);
        assert_eq!(early, vec![load]);
        assert_eq!(aggregator.bucket_count(), 1);

        let forced = aggregator.pop_flush(ts(5), true);
        assert_eq!(forced, vec![int_report("requests", 1, 0, 1)]);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_merge_back_after_failed_dispatch() {
        let mut aggregator = Aggregator::new(test_schema());

        aggregator.accept(int_report("requests", 5, 0, 10), ts(0)).unwrap();
        let popped = aggregator.pop_flush(ts(60), true);

        // A report for the next range arrives while dispatch is failing.
        aggregator.accept(int_report("requests", 2, 10, 20), ts(60)).unwrap();
        aggregator.merge_back(popped, ts(60));

        let reports = aggregator.pop_flush(ts(120), true);
        assert_eq!(reports, vec![int_report("requests", 7, 0, 20)]);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut aggregator = Aggregator::new(test_schema());
        aggregator.accept(int_report("requests", 5, 0, 10), ts(0)).unwrap();
        aggregator
            .accept(labeled(int_report("requests", 2, 0, 10), "zone", "b"), ts(0))
            .unwrap();

        let state = aggregator.snapshot();
        let serialized = serde_json::to_string(&state).unwrap();
        let deserialized: AggregatorState = serde_json::from_str(&serialized).unwrap();
        assert_eq!(state, deserialized);

        let mut restored = Aggregator::new(test_schema());
        restored.restore(deserialized);
        assert_eq!(restored.bucket_count(), 2);

        // The restored watermarks still reject the original ranges.
        let error = restored
            .accept(int_report("requests", 5, 0, 10), ts(30))
            .unwrap_err();
        assert!(matches!(error, AcceptError::OverlappingWindow { .. }));

        assert_eq!(restored.pop_flush(ts(30), false), aggregator.pop_flush(ts(30), false));
    }
}
