//! Pending-change and tombstone administration

use anyhow::Result;

use stockroom_core::SyncEngine;

use crate::output::Output;

/// List queued operations
pub fn pending(engine: &SyncEngine, output: &Output) -> Result<()> {
    output.print_pending(&engine.pending_operations());
    Ok(())
}

/// Drop every queued operation
pub fn clear_pending(engine: &SyncEngine, output: &Output) -> Result<()> {
    let dropped = engine.clear_pending();
    output.success(&format!("Discarded {} pending change(s)", dropped));
    Ok(())
}

/// Show every locally deleted entity again
pub fn restore_deleted(engine: &SyncEngine, output: &Output) -> Result<()> {
    let released = engine.restore_all_deleted();
    output.success(&format!("Restored {} deleted entit(ies)", released));
    Ok(())
}

/// Print everything in the local cache
pub fn cached(engine: &SyncEngine, limit: usize, output: &Output) -> Result<()> {
    output.print_entities(&engine.cached_entities(limit));
    Ok(())
}
