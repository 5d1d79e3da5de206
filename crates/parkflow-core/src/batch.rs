use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Record;

/// The changed records of one ingested snapshot, with the sequence number
/// assigned at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonic batch sequence number (starts at 1).
    pub seq: u64,
    pub ingested_at: DateTime<Utc>,
    /// Identifier of the snapshot this batch was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Changed records only, in arrival order.
    pub rows: Vec<Record>,
}

impl Batch {
    pub fn new(seq: u64, rows: Vec<Record>) -> Self {
        Self {
            seq,
            ingested_at: Utc::now(),
            source: None,
            rows,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
