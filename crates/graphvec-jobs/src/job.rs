//! Job wire model and processing outcomes.

use crate::error::JobResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Kind of entity a job refers to. Selects the store collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Node,
    Edge,
    NodeType,
    EdgeType,
}

impl EntityKind {
    /// Returns the store collection (table) holding entities of this kind.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Node => "nodes",
            Self::Edge => "edges",
            Self::NodeType => "node_types",
            Self::EdgeType => "edge_types",
        }
    }

    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Edge => "edge",
            Self::NodeType => "nodeType",
            Self::EdgeType => "edgeType",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work carried in a message.
///
/// ```json
/// { "entityType": "node", "entityId": "n1", "timestamp": "2024-05-01T12:00:00Z", "retryCount": 0 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Which collection to query.
    #[serde(rename = "entityType")]
    pub entity_kind: EntityKind,

    /// Opaque identifier, unique within its kind.
    #[serde(rename = "entityId")]
    pub entity_id: String,

    /// When the job was submitted. Informational only: a timestamp that
    /// cannot be parsed is dropped rather than rejecting the job.
    #[serde(
        rename = "timestamp",
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub submitted_at: Option<DateTime<Utc>>,

    /// Number of times this job has been requeued.
    #[serde(rename = "retryCount", default)]
    pub attempt: u32,
}

impl Job {
    /// Creates a fresh job submitted now.
    pub fn new(entity_kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            entity_kind,
            entity_id: entity_id.into(),
            submitted_at: Some(Utc::now()),
            attempt: 0,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Decodes a job from a delivery payload.
    pub fn decode(payload: &[u8]) -> JobResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encodes the job for publishing.
    pub fn encode(&self) -> JobResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(serde_json::Value::as_str).and_then(parse_timestamp))
}

/// Parses RFC 3339, or an ISO-8601 date-time or date without offset as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(at.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

/// Why a delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The embedding was generated and stored.
    Succeeded,
    /// A terminal error; the job will never succeed.
    Discarded,
    /// A retryable error, but the attempt budget is spent.
    Exhausted,
}

/// Result of handling one job. Exactly one of ack or requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Acknowledge the delivery; do not process again.
    Acked(Disposition),
    /// Republish with this attempt count, then acknowledge the original.
    Requeued(u32),
}

impl ProcessingOutcome {
    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acked(Disposition::Succeeded) => "succeeded",
            Self::Acked(Disposition::Discarded) => "discarded",
            Self::Acked(Disposition::Exhausted) => "exhausted",
            Self::Requeued(_) => "requeued",
        }
    }
}
