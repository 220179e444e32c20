use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use tally_config::DiskEndpointConfig;
use tally_metrics::{MetricBatch, MetricReport};

use crate::{BuildError, Endpoint, EndpointReport, SendError};

/// An endpoint that writes usage reports into a local directory.
///
/// Each report becomes one JSON file named `<endpoint>_<dedup_id>.json`, so a
/// retried delivery overwrites its previous attempt instead of duplicating it.
/// Optionally, files older than the configured horizon are swept on every
/// delivery.
#[derive(Debug)]
pub struct DiskEndpoint {
    name: String,
    report_dir: PathBuf,
    expire: Option<Duration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiskDocument<'a> {
    id: Uuid,
    batch_id: &'a str,
    reports: &'a [MetricReport],
}

impl DiskEndpoint {
    /// Creates a disk endpoint from its configuration.
    pub fn new(name: &str, config: &DiskEndpointConfig) -> Self {
        Self {
            name: name.to_owned(),
            report_dir: config.report_dir.clone(),
            expire: config.expire_seconds.map(Duration::from_secs),
        }
    }

    /// Removes report files that have outlived the expiry horizon.
    async fn sweep_expired(&self) {
        let Some(expire) = self.expire else {
            return;
        };

        let Ok(mut dir) = tokio::fs::read_dir(&self.report_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let expired = entry
                .metadata()
                .await
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > expire);

            if expired {
                if let Err(error) = tokio::fs::remove_file(&path).await {
                    tally_log::debug!(endpoint = %self.name, ?path, %error, "failed to expire report file");
                }
            }
        }
    }
}

impl Endpoint for DiskEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_report(&self, batch: &MetricBatch) -> Result<EndpointReport, BuildError> {
        let dedup_id = Uuid::new_v4();
        let payload = serde_json::to_value(DiskDocument {
            id: dedup_id,
            batch_id: &batch.id,
            reports: &batch.reports,
        })?;

        Ok(EndpointReport {
            batch_id: batch.id.clone(),
            dedup_id,
            payload,
        })
    }

    fn send<'a>(&'a self, report: &'a EndpointReport) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.report_dir)
                .await
                .map_err(SendError::transient)?;

            let path = self
                .report_dir
                .join(format!("{}_{}.json", self.name, report.dedup_id));
            let temp = path.with_extension("tmp");

            let bytes =
                serde_json::to_vec_pretty(&report.payload).map_err(SendError::permanent)?;

            tokio::fs::write(&temp, &bytes)
                .await
                .map_err(SendError::transient)?;
            tokio::fs::rename(&temp, &path)
                .await
                .map_err(SendError::transient)?;

            tally_log::debug!(endpoint = %self.name, path = %path.display(), "wrote usage report");

            self.sweep_expired().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use tally_metrics::MetricValue;

    use super::*;

    fn batch() -> MetricBatch {
        MetricBatch::new(vec![MetricReport {
            name: "requests".to_owned(),
            value: MetricValue::Int64Value(12),
            start_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            end_time: Utc.timestamp_opt(1_700_000_020, 0).unwrap(),
            labels: BTreeMap::new(),
        }])
    }

    fn endpoint(dir: &std::path::Path) -> DiskEndpoint {
        DiskEndpoint::new(
            "on_disk",
            &DiskEndpointConfig {
                report_dir: dir.to_owned(),
                expire_seconds: None,
            },
        )
    }

    #[tokio::test]
    async fn test_writes_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path());

        let batch = batch();
        let report = endpoint.build_report(&batch).unwrap();
        endpoint.send(&report).await.unwrap();

        let path = dir
            .path()
            .join(format!("on_disk_{}.json", report.dedup_id));
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(written["batchId"], serde_json::json!(batch.id));
        assert_eq!(written["id"], serde_json::json!(report.dedup_id.to_string()));
        assert_eq!(written["reports"][0]["value"]["int64Value"], serde_json::json!(12));
    }

    #[tokio::test]
    async fn test_resend_overwrites_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path());

        let report = endpoint.build_report(&batch()).unwrap();
        endpoint.send(&report).await.unwrap();
        endpoint.send(&report).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = DiskEndpoint::new(
            "on_disk",
            &DiskEndpointConfig {
                report_dir: dir.path().to_owned(),
                expire_seconds: Some(3600),
            },
        );

        let first = endpoint.build_report(&batch()).unwrap();
        endpoint.send(&first).await.unwrap();
        let second = endpoint.build_report(&batch()).unwrap();
        endpoint.send(&second).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_dedup_id_fixed_into_payload() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path());

        let report = endpoint.build_report(&batch()).unwrap();
        assert_eq!(
            report.payload["id"],
            serde_json::json!(report.dedup_id.to_string())
        );
    }
}
