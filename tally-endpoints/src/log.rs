use futures::future::BoxFuture;
use uuid::Uuid;

use tally_metrics::MetricBatch;

use crate::{BuildError, Endpoint, EndpointReport, SendError};

/// An endpoint that emits usage batches through the agent's own log output.
///
/// Useful to observe the fan-out without configuring a remote. Delivery never
/// fails.
#[derive(Debug)]
pub struct LogEndpoint {
    name: String,
}

impl LogEndpoint {
    /// Creates a log endpoint.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl Endpoint for LogEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_report(&self, batch: &MetricBatch) -> Result<EndpointReport, BuildError> {
        Ok(EndpointReport {
            batch_id: batch.id.clone(),
            dedup_id: Uuid::new_v4(),
            payload: serde_json::to_value(batch)?,
        })
    }

    fn send<'a>(&'a self, report: &'a EndpointReport) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            tally_log::info!(
                endpoint = %self.name,
                batch = %report.batch_id,
                payload = %report.payload,
                "usage batch"
            );
            Ok(())
        })
    }
}
