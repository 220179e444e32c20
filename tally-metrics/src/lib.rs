//! Usage report model and aggregation for the tally metering agent.
//!
//! This crate contains the pure core of the reporting pipeline: the wire model
//! for usage reports ([`MetricReport`], [`MetricValue`], [`MetricBatch`]) and
//! the [`Aggregator`], which coalesces reports per `(name, labels)` bucket
//! under a strict time-monotonicity rule and emits batches when a bucket's
//! aggregation window elapses.
//!
//! Everything here is synchronous and side-effect free; the services in the
//! server crate drive the aggregator, persist its snapshots and hand finished
//! batches to the dispatcher.

#![warn(missing_docs)]

mod aggregator;
mod report;

pub use self::aggregator::*;
pub use self::report::*;
