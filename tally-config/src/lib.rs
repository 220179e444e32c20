//! Configuration for the tally metering agent.
//!
//! The agent reads a single YAML file naming the accepted metrics, the remote
//! endpoints to fan out to, optional heartbeat sources, and the retry policy.
//! [`Config::from_path`] loads and validates the file; everything else in the
//! workspace consumes the typed accessors.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
