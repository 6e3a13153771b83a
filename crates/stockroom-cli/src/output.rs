//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use stockroom_core::{Entity, Listing, PendingOperation, Projection, SyncReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a single entity with all its fields
    pub fn print_entity(&self, entity: &Projection<Entity>) {
        match self.format {
            OutputFormat::Human => {
                let inner = entity.get();
                println!("ID:     {}{}", inner.id, pending_marker(entity));
                for (key, value) in &inner.fields {
                    println!("{:<7} {}", format!("{}:", key), display_value(value));
                }
            }
            OutputFormat::Json => self.json(entity),
            OutputFormat::Quiet => println!("{}", entity.id()),
        }
    }

    /// Print one page of entities
    pub fn print_listing(&self, listing: &Listing) {
        match self.format {
            OutputFormat::Human => {
                if listing.items.is_empty() {
                    println!("No entities found.");
                } else {
                    for item in &listing.items {
                        println!(
                            "{:>8} | {}{}",
                            item.id().to_string(),
                            truncate(&item.get().display_name(), 50),
                            pending_marker(item)
                        );
                    }
                }
                println!(
                    "\nPage {} of {} ({} total){}",
                    listing.current_page,
                    listing.total_pages,
                    listing.total_items,
                    if listing.from_cache {
                        " - offline, from cache"
                    } else {
                        ""
                    }
                );
            }
            OutputFormat::Json => self.json(listing),
            OutputFormat::Quiet => {
                for item in &listing.items {
                    println!("{}", item.id());
                }
            }
        }
    }

    /// Print a plain list of entities
    pub fn print_entities(&self, entities: &[Projection<Entity>]) {
        match self.format {
            OutputFormat::Human => {
                if entities.is_empty() {
                    println!("No entities cached.");
                    return;
                }
                for item in entities {
                    println!(
                        "{:>8} | {}{}",
                        item.id().to_string(),
                        truncate(&item.get().display_name(), 50),
                        pending_marker(item)
                    );
                }
                println!("\n{} entit(ies)", entities.len());
            }
            OutputFormat::Json => self.json(entities),
            OutputFormat::Quiet => {
                for item in entities {
                    println!("{}", item.id());
                }
            }
        }
    }

    /// Print queued operations
    pub fn print_pending(&self, ops: &[PendingOperation]) {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("No pending changes.");
                    return;
                }
                for op in ops {
                    let target = op
                        .target()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} | {:<6} | {:>8} | {} field(s) | {}",
                        &op.id.to_string()[..8],
                        op.kind,
                        target,
                        op.payload.len(),
                        op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("\n{} pending change(s)", ops.len());
            }
            OutputFormat::Json => self.json(ops),
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.id);
                }
            }
        }
    }

    /// Print the outcome of a sync pass
    pub fn print_report(&self, report: &SyncReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Sync: {}", report);
                for rejected in &report.rejected {
                    println!(
                        "  rejected {} {}: {}",
                        rejected.kind,
                        rejected
                            .entity_id
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "-".to_string()),
                        rejected.message
                    );
                }
            }
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn pending_marker(entity: &Projection<Entity>) -> &'static str {
    if entity.is_provisional() {
        " (pending)"
    } else {
        ""
    }
}

/// Strings print bare, everything else as JSON
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ääääääääääää", 5), "ää...");
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("Mug")), "Mug");
        assert_eq!(display_value(&json!(9.5)), "9.5");
        assert_eq!(display_value(&json!(["a"])), r#"["a"]"#);
    }
}
