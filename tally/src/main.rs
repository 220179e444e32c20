//! The tally metering agent.
//!
//! Tally is a standalone daemon that accepts usage reports from client
//! software over a localhost HTTP interface, aggregates them per metric, and
//! reports the aggregates to one or more configured remote endpoints with
//! durable at-least-once delivery.
//!
//! # Workspace Crates
//!
//! The agent is split into the following workspace crates:
//!
//!  - `tally`: Main entry point and command line interface.
//!  - [`tally-common`]: Time and retry utilities.
//!  - [`tally-config`]: Configuration file loading and validation.
//!  - [`tally-endpoints`]: Remote endpoint variants.
//!  - [`tally-log`]: Logging setup.
//!  - [`tally-metrics`]: Usage report model and aggregation.
//!  - [`tally-server`]: Services and the HTTP surface.
//!  - [`tally-system`]: Message-passing service foundation.
//!
//! [`tally-common`]: ../tally_common/index.html
//! [`tally-config`]: ../tally_config/index.html
//! [`tally-endpoints`]: ../tally_endpoints/index.html
//! [`tally-log`]: ../tally_log/index.html
//! [`tally-metrics`]: ../tally_metrics/index.html
//! [`tally-server`]: ../tally_server/index.html
//! [`tally-system`]: ../tally_system/index.html

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error:#}");
            1
        }
    };

    process::exit(exit_code);
}
