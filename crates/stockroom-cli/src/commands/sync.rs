//! Sync command handler

use anyhow::{bail, Result};

use stockroom_core::SyncEngine;

use crate::output::Output;

/// Reconcile pending changes with the server
pub async fn sync(engine: &SyncEngine, output: &Output) -> Result<()> {
    let pending = engine.pending_count();
    output.message(&format!("Syncing {} pending change(s)...", pending));

    if !engine.probe_server_now().await {
        bail!(
            "Server not reachable at {}. Pending changes are kept and will be sent later.",
            engine.config().server_url
        );
    }

    let report = engine.sync().await;
    output.print_report(&report);

    if report.is_clean() {
        output.success("Sync complete");
    } else if !report.rejected.is_empty() {
        output.message("Rejected changes were dropped; the server copy is shown again.");
    }

    Ok(())
}

/// Sync before a command if the server answers; errors only logged
pub async fn sync_quiet(engine: &SyncEngine) {
    if engine.probe_server_now().await {
        let report = engine.sync().await;
        tracing::debug!(%report, "Auto-sync finished");
    }
}
