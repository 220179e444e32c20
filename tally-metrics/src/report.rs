use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The numeric kind of a metric value, as declared in the configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Signed 64-bit integer values.
    Int64,
    /// Double precision floating point values.
    Double,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64 => write!(f, "int64"),
            Self::Double => write!(f, "double"),
        }
    }
}

/// A scalar usage value.
///
/// Serializes to the externally tagged wire form `{"int64Value": 5}` or
/// `{"doubleValue": 1.5}`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricValue {
    /// A signed 64-bit integer value.
    Int64Value(i64),
    /// A double precision floating point value.
    DoubleValue(f64),
}

impl MetricValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int64Value(_) => ValueKind::Int64,
            Self::DoubleValue(_) => ValueKind::Double,
        }
    }

    /// Adds another value of the same kind.
    ///
    /// Returns `None` if the kinds differ or if an integer addition overflows.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Int64Value(a), Self::Int64Value(b)) => a.checked_add(b).map(Self::Int64Value),
            (Self::DoubleValue(a), Self::DoubleValue(b)) => Some(Self::DoubleValue(a + b)),
            _ => None,
        }
    }

    /// Adds another value of the same kind, clamping integer overflow.
    ///
    /// Returns `None` only if the kinds differ.
    pub fn saturating_add(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Int64Value(a), Self::Int64Value(b)) => Some(Self::Int64Value(a.saturating_add(b))),
            (Self::DoubleValue(a), Self::DoubleValue(b)) => Some(Self::DoubleValue(a + b)),
            _ => None,
        }
    }
}

/// The aggregation bucket key of a report: its metric name and label set.
///
/// Labels are kept in a `BTreeMap` so that equal label sets compare equal
/// regardless of the order in which a client sent them.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct ReportKey {
    /// The metric name.
    pub name: String,
    /// The label set.
    pub labels: BTreeMap<String, String>,
}

/// A single usage observation posted by a client.
///
/// The time range is half-open; a follow-up report for the same key must start
/// at or after this report's end time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReport {
    /// The metric name. Must be declared in the configured schema.
    pub name: String,
    /// The observed value.
    pub value: MetricValue,
    /// Beginning of the covered time range.
    pub start_time: DateTime<Utc>,
    /// End of the covered time range.
    pub end_time: DateTime<Utc>,
    /// Labels distinguishing sub-streams of the same metric.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricReport {
    /// Returns the aggregation bucket key of this report.
    pub fn key(&self) -> ReportKey {
        ReportKey {
            name: self.name.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// A batch of aggregated reports produced at window close.
///
/// The `id` is assigned exactly once when the batch is formed and never changes
/// afterwards, which makes it usable as a deduplication key by remote
/// endpoints. No two reports in a batch share a [`ReportKey`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricBatch {
    /// Stable batch identifier.
    pub id: String,
    /// The aggregated reports, ordered by bucket key.
    pub reports: Vec<MetricReport>,
}

impl MetricBatch {
    /// Creates a batch with a freshly assigned identifier.
    pub fn new(reports: Vec<MetricReport>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_value_wire_format() {
        let int = serde_json::to_value(MetricValue::Int64Value(5)).unwrap();
        assert_eq!(int, serde_json::json!({"int64Value": 5}));

        let double = serde_json::to_value(MetricValue::DoubleValue(1.5)).unwrap();
        assert_eq!(double, serde_json::json!({"doubleValue": 1.5}));
    }

    #[test]
    fn test_report_wire_format() {
        let report = MetricReport {
            name: "requests".to_owned(),
            value: MetricValue::Int64Value(10),
            start_time: Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 10).unwrap(),
            labels: BTreeMap::from([("zone".to_owned(), "a".to_owned())]),
        };

        similar_asserts::assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "name": "requests",
                "value": {"int64Value": 10},
                "startTime": "2026-08-02T10:00:00Z",
                "endTime": "2026-08-02T10:00:10Z",
                "labels": {"zone": "a"}
            })
        );
    }

    #[test]
    fn test_report_parses_without_labels() {
        let report: MetricReport = serde_json::from_value(serde_json::json!({
            "name": "requests",
            "value": {"doubleValue": 0.5},
            "startTime": "2026-08-02T10:00:00Z",
            "endTime": "2026-08-02T10:00:10Z"
        }))
        .unwrap();

        assert!(report.labels.is_empty());
        assert_eq!(report.value.kind(), ValueKind::Double);
    }

    #[test]
    fn test_checked_add() {
        let five = MetricValue::Int64Value(5);
        let seven = MetricValue::Int64Value(7);
        assert_eq!(five.checked_add(seven), Some(MetricValue::Int64Value(12)));

        // Mixed kinds do not add.
        assert_eq!(five.checked_add(MetricValue::DoubleValue(1.0)), None);

        // Overflow is an error, not a wrap.
        let max = MetricValue::Int64Value(i64::MAX);
        assert_eq!(max.checked_add(MetricValue::Int64Value(1)), None);
        assert_eq!(
            max.saturating_add(MetricValue::Int64Value(1)),
            Some(MetricValue::Int64Value(i64::MAX))
        );
    }

    #[test]
    fn test_key_ignores_label_order() {
        let mut first = BTreeMap::new();
        first.insert("a".to_owned(), "1".to_owned());
        first.insert("b".to_owned(), "2".to_owned());

        let mut second = BTreeMap::new();
        second.insert("b".to_owned(), "2".to_owned());
        second.insert("a".to_owned(), "1".to_owned());

        let key = |labels: BTreeMap<String, String>| ReportKey {
            name: "requests".to_owned(),
            labels,
        };

        assert_eq!(key(first), key(second));
    }

    #[test]
    fn test_batch_id_is_stable() {
        let batch = MetricBatch::new(Vec::new());
        let serialized = serde_json::to_string(&batch).unwrap();
        let restored: MetricBatch = serde_json::from_str(&serialized).unwrap();
        assert_eq!(batch.id, restored.id);
    }
}
