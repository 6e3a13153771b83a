//! Entity command handlers

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use stockroom_core::{EntityId, ListQuery, SyncEngine};

use crate::output::Output;

/// List one page of the collection
pub async fn list(
    engine: &SyncEngine,
    page: u32,
    filters: Vec<String>,
    output: &Output,
) -> Result<()> {
    let mut query = ListQuery::new(page, engine.config().page_size);
    query.filters = parse_filters(&filters)?;

    let listing = engine.list(query).await.context("Failed to list entities")?;
    output.print_listing(&listing);
    Ok(())
}

/// Create an entity from `key=value` pairs
pub async fn create(engine: &SyncEngine, fields: Vec<String>, output: &Output) -> Result<()> {
    let fields = parse_fields(&fields)?;
    let created = engine
        .create(fields)
        .await
        .context("Failed to create entity")?;

    if created.is_provisional() {
        output.success(&format!(
            "Queued new entity {} (will sync when online)",
            created.id()
        ));
    } else {
        output.success(&format!("Created entity {}", created.id()));
    }
    output.print_entity(&created);
    Ok(())
}

pub async fn update(
    engine: &SyncEngine,
    id: String,
    fields: Vec<String>,
    output: &Output,
) -> Result<()> {
    let id = EntityId::new(id);
    let fields = parse_fields(&fields)?;
    let updated = engine
        .update(&id, fields)
        .await
        .with_context(|| format!("Failed to update entity {}", id))?;

    if updated.is_provisional() {
        output.success(&format!("Queued update of {}", id));
    } else {
        output.success(&format!("Updated entity {}", id));
    }
    output.print_entity(&updated);
    Ok(())
}

pub async fn delete(engine: &SyncEngine, id: String, output: &Output) -> Result<()> {
    let id = EntityId::new(id);
    let deleted = engine
        .delete(&id)
        .await
        .with_context(|| format!("Failed to delete entity {}", id))?;

    if deleted.is_provisional() {
        output.success(&format!("Queued deletion of {}", id));
    } else {
        output.success(&format!("Deleted entity {}", id));
    }
    Ok(())
}

/// Parse `key=value` pairs; values are JSON when they parse as JSON
pub fn parse_fields(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let (key, raw) = split_pair(pair)?;
        if key == "id" {
            bail!("The id field is assigned by the server");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

/// Parse `key=value` listing filters
pub fn parse_filters(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| split_pair(pair).map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("Expected key=value, got '{}'", pair),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fields_detects_json() {
        let fields = parse_fields(&[
            "name=Blue Mug".to_string(),
            "price=9.5".to_string(),
            "stock=3".to_string(),
            "featured=true".to_string(),
            "keywords=[\"mug\",\"blue\"]".to_string(),
        ])
        .unwrap();

        assert_eq!(fields["name"], json!("Blue Mug"));
        assert_eq!(fields["price"], json!(9.5));
        assert_eq!(fields["stock"], json!(3));
        assert_eq!(fields["featured"], json!(true));
        assert_eq!(fields["keywords"], json!(["mug", "blue"]));
    }

    #[test]
    fn test_parse_fields_rejects_bad_pairs() {
        assert!(parse_fields(&["no-equals".to_string()]).is_err());
        assert!(parse_fields(&["=value".to_string()]).is_err());
        assert!(parse_fields(&["id=5".to_string()]).is_err());
    }

    #[test]
    fn test_parse_filters() {
        let filters =
            parse_filters(&["category=Kitchen".to_string(), "sort=price".to_string()]).unwrap();
        assert_eq!(filters.get("category").map(String::as_str), Some("Kitchen"));
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn test_empty_value_kept_as_string() {
        let fields = parse_fields(&["description=".to_string()]).unwrap();
        assert_eq!(fields["description"], json!(""));
    }
}
