//! Message envelope
//!
//! `MessageEnvelope` is the unit moved through every broker backend. The
//! broker treats `payload` as opaque: it is cloned and forwarded, never
//! inspected or rewritten.
//!
//! Notes on fields:
//! - `id`: unique identity used for logging, Kafka record keys and answer
//!   correlation
//! - `parent_id`: id of the envelope this one was derived from, if any
//! - `payload`: JSON body supplied by the producer
//! - `created_at`: milliseconds since UNIX epoch, set on construction

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

impl MessageEnvelope {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an envelope correlated with `self`, e.g. an answer.
    pub fn create_child(&self, payload: serde_json::Value) -> Self {
        Self {
            parent_id: Some(self.id),
            ..Self::new(payload)
        }
    }

    /// Wire encoding used by the Kafka backend. `decode` is its inverse.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
