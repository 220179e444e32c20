use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use tally_config::Config;
use tally_server::Persistence;

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let matches = make_app().get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .expect("required argument");
    let config = Arc::new(Config::from_path(config_path)?);

    tally_log::init(config.logging());

    let (persistence, state_location) = if matches.get_flag("no_state") {
        (Persistence::memory(), "in-memory".to_owned())
    } else {
        let state_dir = matches
            .get_one::<PathBuf>("state_dir")
            .expect("required argument");
        let persistence =
            Persistence::disk(state_dir).context("failed to prepare the state directory")?;
        (persistence, state_dir.display().to_string())
    };

    let port = *matches
        .get_one::<u16>("local_port")
        .expect("required argument");

    setup::dump_spawn_infos(&config, &state_location, port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime
        .block_on(tally_server::run(config, persistence, port))
        .context("agent failed")?;

    tally_log::info!("shutdown complete");
    Ok(())
}
