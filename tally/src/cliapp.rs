//! This module implements the definition of the command line app.

use clap::builder::ValueParser;
use clap::{value_parser, Arg, ArgAction, Command, ValueHint};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "A local usage-metering agent.";

pub fn make_app() -> Command {
    Command::new("tally")
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .after_help(
            "This runs the agent in the foreground until it's shut down. It binds the \
             configured metrics pipeline to a local HTTP port where clients post their \
             usage reports.",
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .required(true)
                .value_hint(ValueHint::FilePath)
                .value_parser(ValueParser::path_buf())
                .help("The path to the configuration file."),
        )
        .arg(
            Arg::new("state_dir")
                .long("state-dir")
                .value_hint(ValueHint::DirPath)
                .value_parser(ValueParser::path_buf())
                .required_unless_present("no_state")
                .conflicts_with("no_state")
                .help("The directory holding persistent state."),
        )
        .arg(
            Arg::new("no_state")
                .long("no-state")
                .action(ArgAction::SetTrue)
                .help("Do not store persistent state; queued reports die with the process."),
        )
        .arg(
            Arg::new("local_port")
                .long("local-port")
                .short('p')
                .required(true)
                .value_parser(value_parser!(u16).range(1..))
                .help("The local HTTP port to listen on."),
        )
}
