//! The tally metering agent server.
//!
//! This crate wires the reporting pipeline together and exposes it over a
//! localhost HTTP surface:
//!
//! ```text
//! POST /report ─► AggregatorService ─► DispatcherService ─┬─► RetryingSender ─► Endpoint
//!                                                         ├─► RetryingSender ─► Endpoint
//!                        StatusTrackerService ◄───────────┘
//! GET /status  ◄── StatusTrackerService
//! ```
//!
//! The aggregator coalesces reports per metric until the metric's window
//! elapses, then hands a batch to the dispatcher. The dispatcher fans the
//! batch out to one retrying sender per configured endpoint and acknowledges
//! the aggregator once every sender has the batch on its durable queue; only
//! then does the aggregator drop its buckets. Terminal delivery outcomes flow
//! back through the dispatcher into the status tracker, which serves the
//! `/status` resource.
//!
//! All pipeline state (aggregation buckets, watermarks, send queues) is
//! persisted through [`Persistence`] so that accepted reports survive process
//! restarts.

#![warn(missing_docs)]

mod endpoints;
mod persistence;
mod service;
mod services;

pub use self::persistence::*;
pub use self::service::*;
pub use self::services::*;
