//! Foundational primitives for tally's services.
//!
//! Every long-lived component of the agent is a [`Service`]: a task that owns
//! its state and receives messages through an [`Addr`]. Messages conform to an
//! [`Interface`], which declares per-message response behavior through
//! [`FromMessage`]. The [`Controller`] distributes shutdown signals to all
//! services.

#![warn(missing_docs)]

mod controller;
mod service;

pub use self::controller::*;
pub use self::service::*;
