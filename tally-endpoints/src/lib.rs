//! Remote endpoint variants for the tally metering agent.
//!
//! An [`Endpoint`] turns a [`MetricBatch`](tally_metrics::MetricBatch) into an
//! endpoint-specific [`EndpointReport`] and delivers it to a remote. The
//! retry/queue machinery in the server crate is endpoint-agnostic; endpoints
//! only classify their failures as transient or permanent through
//! [`SendError`].

#![warn(missing_docs)]

mod disk;
mod endpoint;
mod log;
mod service_control;

pub use self::disk::*;
pub use self::endpoint::*;
pub use self::log::*;
pub use self::service_control::*;
