//! Watch command: run the engine in the foreground

use anyhow::{Context, Result};
use tracing::info;

use stockroom_core::SyncEngine;

use crate::output::Output;

/// Keep the engine running until Ctrl-C
///
/// Probes the server periodically, drains pending changes whenever it
/// becomes reachable and applies realtime pushes if a realtime URL is set.
pub async fn run(engine: &SyncEngine, output: &Output) -> Result<()> {
    let mut availability = engine.subscribe_availability();
    let mut reports = engine.subscribe_reports();

    engine.start();
    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = availability.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *availability.borrow_and_update();
                info!(?state, "Availability");
                output.message(if state.effective_online() {
                    "Server reachable"
                } else {
                    "Server unreachable, changes will be queued"
                });
            }
            changed = reports.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = reports.borrow_and_update().clone();
                if let Some(report) = report {
                    output.print_report(&report);
                }
            }
        }
    }

    output.message("Stopping...");
    engine.shutdown().await;
    Ok(())
}
