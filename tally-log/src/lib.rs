//! Logging for the tally metering agent.
//!
//! Wraps `tracing` initialization with the agent's log configuration. Re-exports
//! the `tracing` macros so that crates in this workspace only depend on this
//! crate for logging.

#![warn(missing_docs)]

mod setup;
pub mod test;

pub use self::setup::*;

// Re-export the minimal tracing API used across the workspace.
pub use tracing::{debug, error, info, trace, warn, Level};
