//! Realtime push message types
//!
//! Every websocket text frame carries one JSON envelope:
//! `{"type": "ENTITY_CREATED", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Entity, EntityId};

pub const ENTITY_CREATED: &str = "ENTITY_CREATED";
pub const ENTITY_UPDATED: &str = "ENTITY_UPDATED";
pub const ENTITY_DELETED: &str = "ENTITY_DELETED";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

/// Raw envelope as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }

    pub fn encode(&self) -> String {
        // An envelope is a string plus a JSON value; serializing it cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Interpret the envelope
    pub fn event(&self) -> Result<RealtimeEvent, MessageError> {
        match self.kind.as_str() {
            ENTITY_CREATED => Ok(RealtimeEvent::Created(self.entity()?)),
            ENTITY_UPDATED => Ok(RealtimeEvent::Updated(self.entity()?)),
            ENTITY_DELETED => Ok(RealtimeEvent::Deleted(self.entity_id()?)),
            PING => Ok(RealtimeEvent::Ping),
            PONG => Ok(RealtimeEvent::Pong),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    fn entity(&self) -> Result<Entity, MessageError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| MessageError::InvalidData(self.kind.clone(), e.to_string()))
    }

    /// Deletions carry `{"id": ...}` or just the id
    fn entity_id(&self) -> Result<EntityId, MessageError> {
        let raw = self.data.get("id").unwrap_or(&self.data).clone();
        serde_json::from_value(raw)
            .map_err(|e| MessageError::InvalidData(self.kind.clone(), e.to_string()))
    }
}

/// A decoded push event
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Created(Entity),
    Updated(Entity),
    Deleted(EntityId),
    Ping,
    Pong,
}

#[derive(Debug, Error, PartialEq)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {0} payload: {1}")]
    InvalidData(String, String),
}
