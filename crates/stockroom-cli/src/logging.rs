//! Logging setup

use std::fs::OpenOptions;

use tracing_subscriber::EnvFilter;

use stockroom_core::Config;

/// Filter for our crates at `level`; `RUST_LOG` wins when set
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("stockroom_core={},stockroom_cli={}", level, level))
    })
}

/// Log to `config.log_file` if set, otherwise to stderr
pub fn init(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = env_filter(level);

    if let Some(ref path) = config.log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                // Ignore error if already initialized
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(file)
                    .try_init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", path, e);
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
