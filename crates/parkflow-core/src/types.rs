use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading for one parking facility, taken from a snapshot.
///
/// This is also the row shape handed to sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque facility identifier (never empty).
    pub facility_key: String,
    /// Number of free spaces. Negative values are passed through untouched.
    pub available_spaces: i64,
    /// Whether the facility reports itself as closed.
    pub closed: bool,
    /// Measurement time reported by the feed.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(facility_key: impl Into<String>, available_spaces: i64, closed: bool) -> Self {
        Self {
            facility_key: facility_key.into(),
            available_spaces,
            closed,
            observed_at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

/// The last committed reading for a facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub available_spaces: i64,
    pub closed: bool,
}

impl From<&Record> for StateEntry {
    fn from(record: &Record) -> Self {
        Self {
            available_spaces: record.available_spaces,
            closed: record.closed,
        }
    }
}

/// A record annotated with the change decision made for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub record: Record,
    pub changed: bool,
    /// The state the record was compared against (`None` on first sight).
    pub previous: Option<StateEntry>,
}

impl ChangeEvent {
    pub fn is_first_observation(&self) -> bool {
        self.previous.is_none()
    }
}
