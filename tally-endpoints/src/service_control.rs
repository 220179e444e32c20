use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use tally_config::ServiceControlEndpointConfig;
use tally_metrics::{MetricBatch, MetricValue};

use crate::{BuildError, CreateError, Endpoint, EndpointReport, SendError};

/// Timeout for a single report call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operation name stamped on all reported operations.
const OPERATION_NAME: &str = "tally.report";

/// Maximum number of response body bytes included in error messages.
const ERROR_BODY_LIMIT: usize = 512;

/// An endpoint reporting usage to a service-control style metering API.
///
/// Every batch becomes one `services/<name>:report` call carrying one
/// operation per aggregated report. Operation ids derive from the report's
/// dedup id, so the remote discards retransmissions.
#[derive(Debug)]
pub struct ServiceControlEndpoint {
    name: String,
    consumer_id: String,
    report_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationValue {
    #[serde(flatten)]
    value: MetricValue,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricValueSet {
    metric_name: String,
    metric_values: Vec<OperationValue>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    operation_id: String,
    operation_name: &'static str,
    consumer_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    metric_value_sets: Vec<MetricValueSet>,
}

#[derive(Serialize)]
struct ReportRequest {
    operations: Vec<Operation>,
}

impl ServiceControlEndpoint {
    /// Creates a service-control endpoint from its configuration.
    ///
    /// The optional credentials file is read once at construction; its content
    /// is used as a bearer token on every call.
    pub fn new(name: &str, config: &ServiceControlEndpointConfig) -> Result<Self, CreateError> {
        let token = match &config.credentials_file {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|source| {
                    CreateError::Credentials {
                        path: path.clone(),
                        source,
                    }
                })?;
                Some(contents.trim().to_owned())
            }
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(CreateError::Client)?;

        Ok(Self {
            name: name.to_owned(),
            consumer_id: config.consumer_id.clone(),
            report_url: format!(
                "{}/v1/services/{}:report",
                config.service_url.trim_end_matches('/'),
                config.service_name
            ),
            token,
            client,
        })
    }

    fn operations(&self, batch: &MetricBatch, dedup_id: Uuid) -> Vec<Operation> {
        batch
            .reports
            .iter()
            .enumerate()
            .map(|(index, report)| Operation {
                operation_id: format!("{dedup_id}-{index}"),
                operation_name: OPERATION_NAME,
                consumer_id: self.consumer_id.clone(),
                start_time: report.start_time,
                end_time: report.end_time,
                labels: report.labels.clone(),
                metric_value_sets: vec![MetricValueSet {
                    metric_name: report.name.clone(),
                    metric_values: vec![OperationValue {
                        value: report.value,
                        start_time: report.start_time,
                        end_time: report.end_time,
                    }],
                }],
            })
            .collect()
    }
}

/// Returns `true` for response codes worth retrying.
fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

impl Endpoint for ServiceControlEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_report(&self, batch: &MetricBatch) -> Result<EndpointReport, BuildError> {
        let dedup_id = Uuid::new_v4();
        let payload = serde_json::to_value(ReportRequest {
            operations: self.operations(batch, dedup_id),
        })?;

        Ok(EndpointReport {
            batch_id: batch.id.clone(),
            dedup_id,
            payload,
        })
    }

    fn send<'a>(&'a self, report: &'a EndpointReport) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            let mut request = self.client.post(&self.report_url).json(&report.payload);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(SendError::transient)?;
            let status = response.status();
            if status.is_success() {
                tally_log::debug!(endpoint = %self.name, batch = %report.batch_id, "usage batch reported");
                return Ok(());
            }

            let mut body = response.text().await.unwrap_or_default();
            body.truncate(ERROR_BODY_LIMIT);
            let message = format!("{status}: {body}");

            Err(if is_retryable(status) {
                SendError::transient(message)
            } else {
                SendError::permanent(message)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;
    use tally_metrics::MetricReport;

    use super::*;

    fn endpoint() -> ServiceControlEndpoint {
        ServiceControlEndpoint::new(
            "control",
            &ServiceControlEndpointConfig {
                service_name: "example.mygoogleservice.com".to_owned(),
                consumer_id: "project:example".to_owned(),
                service_url: "https://servicecontrol.example.com/".to_owned(),
                credentials_file: None,
            },
        )
        .unwrap()
    }

    fn batch() -> MetricBatch {
        MetricBatch::new(vec![
            MetricReport {
                name: "requests".to_owned(),
                value: MetricValue::Int64Value(12),
                start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                end_time: Utc.timestamp_opt(1_700_000_020, 0).unwrap(),
                labels: BTreeMap::from([("zone".to_owned(), "a".to_owned())]),
            },
            MetricReport {
                name: "load".to_owned(),
                value: MetricValue::DoubleValue(0.5),
                start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                end_time: Utc.timestamp_opt(1_700_000_020, 0).unwrap(),
                labels: BTreeMap::new(),
            },
        ])
    }

    #[test]
    fn test_report_url() {
        assert_eq!(
            endpoint().report_url,
            "https://servicecontrol.example.com/v1/services/example.mygoogleservice.com:report"
        );
    }

    #[test]
    fn test_build_report_payload() {
        let endpoint = endpoint();
        let batch = batch();
        let report = endpoint.build_report(&batch).unwrap();

        assert_eq!(report.batch_id, batch.id);

        let operations = report.payload["operations"].as_array().unwrap();
        assert_eq!(operations.len(), 2);

        let first = &operations[0];
        assert_eq!(first["operationId"], serde_json::json!(format!("{}-0", report.dedup_id)));
        assert_eq!(first["consumerId"], serde_json::json!("project:example"));
        assert_eq!(first["labels"]["zone"], serde_json::json!("a"));
        assert_eq!(
            first["metricValueSets"][0]["metricName"],
            serde_json::json!("requests")
        );
        assert_eq!(
            first["metricValueSets"][0]["metricValues"][0]["int64Value"],
            serde_json::json!(12)
        );

        let second = &operations[1];
        assert_eq!(second["operationId"], serde_json::json!(format!("{}-1", report.dedup_id)));
        assert_eq!(
            second["metricValueSets"][0]["metricValues"][0]["doubleValue"],
            serde_json::json!(0.5)
        );
        assert!(second.get("labels").is_none());
    }

    #[test]
    fn test_status_classification() {
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::REQUEST_TIMEOUT));

        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::FORBIDDEN));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_reads_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "secret-token\n").unwrap();

        let endpoint = ServiceControlEndpoint::new(
            "control",
            &ServiceControlEndpointConfig {
                service_name: "svc".to_owned(),
                consumer_id: "project:example".to_owned(),
                service_url: "https://example.com".to_owned(),
                credentials_file: Some(path),
            },
        )
        .unwrap();

        assert_eq!(endpoint.token.as_deref(), Some("secret-token"));
    }
}
