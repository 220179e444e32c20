use tally_config::Config;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config, state_location: &str, port: u16) {
    tally_log::info!("launching tally on port {port}");
    tally_log::info!("  state: {state_location}");
    tally_log::info!("  log level: {}", config.logging().level);

    for metric in config.metrics() {
        tally_log::info!(
            "  metric {}: {} ({}s window)",
            metric.name,
            metric.kind,
            config.buffer_for(metric).as_secs()
        );
    }

    for endpoint in config.endpoints() {
        tally_log::info!("  endpoint {}: {}", endpoint.name, endpoint.kind.variant());
    }

    for source in config.sources() {
        tally_log::info!("  source {}", source.name);
    }
}
