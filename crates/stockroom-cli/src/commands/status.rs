//! Status command handler

use anyhow::Result;

use stockroom_core::SyncEngine;

use crate::output::{Output, OutputFormat};

/// Show availability, queue and cache information
pub fn show(engine: &SyncEngine, output: &Output) -> Result<()> {
    let state = engine.state();
    let config = engine.config();
    let pending = engine.pending_count();
    let deleted = engine.deleted_ids().len();
    let meta = engine.cache_meta();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "server_url": config.server_url,
                    "collection": config.collection,
                    "online": state.effective_online(),
                    "transport_online": state.transport_online,
                    "server_reachable": state.server_reachable,
                    "pending": pending,
                    "deleted": deleted,
                    "cache": meta,
                })
            );
        }
        OutputFormat::Quiet => {
            println!(
                "{}",
                if state.effective_online() {
                    "online"
                } else {
                    "offline"
                }
            );
        }
        OutputFormat::Human => {
            println!("Stockroom Status");
            println!("================");
            println!();
            println!("Server:");
            println!("  URL:        {}/{}", config.server_url, config.collection);
            println!(
                "  Status:     {}",
                if state.effective_online() {
                    "online"
                } else if state.transport_online {
                    "unreachable"
                } else {
                    "no network"
                }
            );
            if let Some(ref url) = config.realtime_url {
                println!("  Realtime:   {}", url);
            }
            println!();
            println!("Local changes:");
            println!("  Pending:    {}", pending);
            println!("  Deleted:    {}", deleted);
            println!();
            println!("Cache:");
            println!("  Location:   {}", config.database_path().display());
            match meta {
                Some(meta) => {
                    println!(
                        "  Last page:  {} of {} ({} items)",
                        meta.last_page, meta.total_pages, meta.total_items
                    );
                    println!(
                        "  Refreshed:  {}",
                        meta.timestamp.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                None => println!("  Empty"),
            }
        }
    }

    Ok(())
}
