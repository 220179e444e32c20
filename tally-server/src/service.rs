use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use tally_config::{Config, EndpointConfig};
use tally_endpoints::{create_endpoint, CreateError};
use tally_system::{Addr, Controller, Service};

use crate::persistence::{Persistence, PersistenceError};
use crate::services::{
    Aggregator, AggregatorService, DispatcherService, ForceFlush, HeartbeatService, HttpServer,
    RetryingSenderService, StatusTracker, StatusTrackerService,
};

/// Indicates the type of failure of the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the local HTTP port failed.
    #[error("failed to bind local HTTP server to port {port}")]
    BindFailed {
        /// The requested port.
        port: u16,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Serving HTTP failed after startup.
    #[error("HTTP server failed")]
    Http(#[source] std::io::Error),

    /// An endpoint could not be constructed from its configuration.
    #[error("failed to initialize endpoint {name:?}")]
    Endpoint {
        /// The endpoint name.
        name: String,
        /// The underlying construction error.
        #[source]
        source: CreateError,
    },

    /// Persisted state could not be restored.
    #[error("failed to restore persisted state")]
    Restore(#[from] PersistenceError),
}

#[derive(Debug)]
struct StateInner {
    config: Arc<Config>,
    aggregator: Addr<Aggregator>,
    status_tracker: Addr<StatusTracker>,
    shutting_down: AtomicBool,
}

/// Handles to all running services, shared with the HTTP layer.
#[derive(Clone, Debug)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Starts all pipeline services and returns their handles.
    ///
    /// Construction order follows the data flow backwards so that every
    /// service receives the addresses it publishes to: status tracker, then
    /// senders (restoring their queues), dispatcher, aggregator (restoring its
    /// snapshot), and finally the heartbeat sources.
    pub async fn start(
        config: Arc<Config>,
        persistence: Persistence,
    ) -> Result<Self, ServerError> {
        let status_tracker = StatusTrackerService::new().start();

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::new();
        for endpoint_config in config.endpoints() {
            let endpoint =
                create_endpoint(endpoint_config).map_err(|source| ServerError::Endpoint {
                    name: endpoint_config.name.clone(),
                    source,
                })?;

            let sender = RetryingSenderService::restore(
                Arc::from(endpoint),
                persistence.clone(),
                config.retry(),
                outcome_tx.clone(),
            )
            .await?;
            senders.push((endpoint_config.name.clone(), sender.start()));
        }
        drop(outcome_tx);

        warn_orphan_queues(&persistence, config.endpoints()).await;

        let dispatcher =
            DispatcherService::new(senders, status_tracker.clone(), outcome_rx).start();

        let aggregator =
            AggregatorService::restore(config.metric_schema(), persistence.clone(), dispatcher)
                .await?
                .start();

        if !config.sources().is_empty() {
            HeartbeatService::new(config.sources().to_vec(), aggregator.clone()).start();
        }

        Ok(ServiceState {
            inner: Arc::new(StateInner {
                config,
                aggregator,
                status_tracker,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the agent configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the address of the aggregator service.
    pub fn aggregator(&self) -> &Addr<Aggregator> {
        &self.inner.aggregator
    }

    /// Returns the address of the status tracker service.
    pub fn status_tracker(&self) -> &Addr<StatusTracker> {
        &self.inner.status_tracker
    }

    /// Returns `true` once a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    /// Marks the agent as shutting down; new reports get `503`.
    pub fn set_shutting_down(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
    }
}

/// Reports persisted queues whose endpoint left the configuration.
///
/// The queues are kept on disk untouched: without the endpoint's parameters
/// they cannot be drained, and deleting them would silently discard accepted
/// reports. Re-adding the endpoint under the same name resumes delivery.
async fn warn_orphan_queues(persistence: &Persistence, endpoints: &[EndpointConfig]) {
    let keys = match persistence.keys_under("sender").await {
        Ok(keys) => keys,
        Err(error) => {
            tally_log::warn!(%error, "failed to scan for orphaned send queues");
            return;
        }
    };

    let configured: HashSet<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
    for key in keys {
        if let Some(name) = key.strip_prefix("sender/") {
            if !configured.contains(name) {
                tally_log::warn!(
                    endpoint = %name,
                    "found a send queue for an endpoint that is no longer configured; \
                     it is kept on disk and resumes if the endpoint returns"
                );
            }
        }
    }
}

/// Runs the agent until a shutdown signal arrives.
///
/// Boots the pipeline, serves HTTP on `127.0.0.1:<port>`, and on shutdown
/// drains in order: the HTTP server stops accepting reports, then the
/// aggregator closes its final window so that everything accepted is durably
/// enqueued. Sender queues stop without draining; they are durable.
pub async fn run(
    config: Arc<Config>,
    persistence: Persistence,
    port: u16,
) -> Result<(), ServerError> {
    Controller::start(config.shutdown_timeout());

    let state = ServiceState::start(config.clone(), persistence).await?;
    let server = HttpServer::new(port, state.clone())?;

    if let Ok(addr) = server.local_addr() {
        tally_log::info!("listening on http://{addr}/");
    }

    tokio::select! {
        result = server.run() => result.map_err(ServerError::Http)?,
        // Hard stop once the grace period after the first signal elapses.
        _ = Controller::shutdown() => {}
    }

    let final_flush = state.aggregator().send(ForceFlush);
    if tokio::time::timeout(config.shutdown_timeout(), final_flush)
        .await
        .is_err()
    {
        tally_log::warn!("final window close did not finish within the shutdown timeout");
    }

    Ok(())
}
