use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tally_config::{EndpointConfig, EndpointKind};
use tally_metrics::MetricBatch;

use crate::{DiskEndpoint, LogEndpoint, ServiceControlEndpoint};

/// Boxed error type carried inside [`SendError`] classifications.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An endpoint-specific payload derived from a batch.
///
/// The `payload` is an opaque document only the producing endpoint interprets.
/// The `dedup_id` is allocated once in [`Endpoint::build_report`] and baked
/// into the payload, so retransmitting the same report is idempotent at the
/// remote. Reports serialize to JSON for the senders' durable queues.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointReport {
    /// Identifier of the batch this report was built from.
    pub batch_id: String,
    /// Stable deduplication identifier; never changes across retries.
    pub dedup_id: Uuid,
    /// The endpoint-specific document to deliver.
    pub payload: serde_json::Value,
}

/// An error building an [`EndpointReport`] from a batch.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Serializing the batch into the endpoint's document failed.
    #[error("failed to serialize batch for the endpoint")]
    Serialization(#[from] serde_json::Error),
}

/// A classified delivery failure.
///
/// Transient failures are retried with backoff; permanent failures drop the
/// report and mark the batch as failed.
#[derive(Debug, Error)]
pub enum SendError {
    /// The failure may resolve on its own (network, 5xx, throttling).
    #[error("transient send failure: {0}")]
    Transient(BoxError),

    /// The remote rejected the report for good (e.g. schema errors).
    #[error("permanent send failure: {0}")]
    Permanent(BoxError),
}

impl SendError {
    /// Classifies an error as transient.
    pub fn transient(error: impl Into<BoxError>) -> Self {
        Self::Transient(error.into())
    }

    /// Classifies an error as permanent.
    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    /// Returns `true` if retrying cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// A remote receiver of usage batches.
///
/// Implementations must keep `build_report` pure apart from dedup-id
/// allocation: building twice from the same batch may differ in the dedup id,
/// but a once-built report must deliver identically on every retry.
pub trait Endpoint: fmt::Debug + Send + Sync {
    /// The configured endpoint name, used in logs and queue keys.
    fn name(&self) -> &str;

    /// Builds the endpoint-specific report for a batch.
    fn build_report(&self, batch: &MetricBatch) -> Result<EndpointReport, BuildError>;

    /// Delivers a previously built report.
    fn send<'a>(&'a self, report: &'a EndpointReport) -> BoxFuture<'a, Result<(), SendError>>;
}

/// An error constructing an endpoint from its configuration.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The credentials file could not be read.
    #[error("could not read credentials file {path:?}")]
    Credentials {
        /// The configured path.
        path: std::path::PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be initialized.
    #[error("could not initialize the HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Constructs the endpoint described by a configuration entry.
pub fn create_endpoint(config: &EndpointConfig) -> Result<Box<dyn Endpoint>, CreateError> {
    Ok(match &config.kind {
        EndpointKind::Disk(disk) => Box::new(DiskEndpoint::new(&config.name, disk)),
        EndpointKind::ServiceControl(sc) => {
            Box::new(ServiceControlEndpoint::new(&config.name, sc)?)
        }
        EndpointKind::Log(_) => Box::new(LogEndpoint::new(&config.name)),
    })
}
