//! Log setup.
//!
//! One plain single-line format for everything the daemon prints, shaped
//! like the kill_stat records so a kill and the pressure decisions around
//! it read as one stream: a short timestamp, the daemon tag with its pid,
//! the level and the emitting module. No ANSI coloring; the output is
//! normally collected by the platform log daemon, not a terminal.

pub fn setup_logging(level: log::LevelFilter) -> Result<(), String> {
    let pid = std::process::id();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} lowmemd[{pid}] {:5} {}: {}",
                chrono::Local::now().format("%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .map_err(|e| format!("Error while setting up logger: {e}"))
}

/// Map the `LOWMEMD_LOG_LEVEL` environment variable onto a level filter.
/// Unset or unrecognized values default to Info.
pub fn level_from_env() -> log::LevelFilter {
    std::env::var("LOWMEMD_LOG_LEVEL")
        .ok()
        .and_then(|s| match s.to_lowercase().as_str() {
            "error" => Some(log::LevelFilter::Error),
            "warn" | "warning" => Some(log::LevelFilter::Warn),
            "info" => Some(log::LevelFilter::Info),
            "debug" => Some(log::LevelFilter::Debug),
            "trace" => Some(log::LevelFilter::Trace),
            _ => None,
        })
        .unwrap_or(log::LevelFilter::Info)
}
