//! Outcome of a reconciliation pass

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::models::EntityId;
use crate::outbox::OperationKind;

/// An operation the server refused for good
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOperation {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub entity_id: Option<EntityId>,
    pub status: Option<u16>,
    pub message: String,
}

/// Counts and rejections from one pass over the outbox
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rejected: Vec<RejectedOperation>,
    /// Whether the server listing was refreshed after the pass
    pub refreshed: bool,
}

impl SyncReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }

    /// True when nothing failed and nothing was left waiting
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if !self.rejected.is_empty() {
            write!(f, " ({} rejected)", self.rejected.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let mut report = SyncReport {
            succeeded: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(report.to_string(), "3 succeeded, 1 failed, 0 skipped");

        report.rejected.push(RejectedOperation {
            operation_id: Uuid::new_v4(),
            kind: OperationKind::Update,
            entity_id: Some(EntityId::from(4)),
            status: Some(422),
            message: "invalid".to_string(),
        });
        assert!(report.to_string().ends_with("(1 rejected)"));
        assert_eq!(report.attempted(), 4);
        assert!(!report.is_clean());
    }
}
