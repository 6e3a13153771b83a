//! Config command handlers

use anyhow::{Context, Result};

use stockroom_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.server_url);
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!("  server_url:             {}", config.server_url);
            println!("  collection:             {}", config.collection);
            println!(
                "  realtime_url:           {}",
                config.realtime_url.as_deref().unwrap_or("(not set)")
            );
            println!("  probe_interval_secs:    {}", config.probe_interval_secs);
            println!("  probe_timeout_secs:     {}", config.probe_timeout_secs);
            println!("  probe_debounce_millis:  {}", config.probe_debounce_millis);
            println!("  storage_quota_bytes:    {}", config.storage_quota_bytes);
            println!("  page_size:              {}", config.page_size);
            println!("  read_all_cap:           {}", config.read_all_cap);
            println!("  cache_max_pages:        {}", config.cache_max_pages);
            println!("  reconnect_initial_secs: {}", config.reconnect_initial_secs);
            println!("  reconnect_max_secs:     {}", config.reconnect_max_secs);
            println!("  log_level:              {}", config.log_level);
            println!(
                "  log_file:               {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set_value(&key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}
