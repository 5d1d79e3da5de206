//! Parsing of raw feed documents into [`Record`]s.
//!
//! A snapshot is either a JSON array of objects or newline-delimited JSON
//! objects. Field names follow the public Lyon parking feed
//! (`mv:currentValue`, `ferme`, `Parking_schema:identifier`, `dct:date`);
//! plain aliases are accepted as well.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::Record;

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(
        rename = "Parking_schema:identifier",
        alias = "identifier",
        alias = "parking_id",
        default
    )]
    identifier: Option<String>,
    #[serde(rename = "mv:currentValue", alias = "current_value", default)]
    current_value: Option<i64>,
    #[serde(rename = "ferme", alias = "closed", default)]
    closed: Option<bool>,
    #[serde(rename = "dct:date", alias = "date", default)]
    date: Option<serde_json::Value>,
}

/// A feed entry that could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Position of the entry inside the snapshot.
    pub index: usize,
    /// Facility key, when it could be read.
    pub facility_key: Option<String>,
    pub reason: String,
}

/// The result of parsing one snapshot document.
#[derive(Debug, Default)]
pub struct ParsedSnapshot {
    /// Valid records, in feed order.
    pub records: Vec<Record>,
    /// Entries that were dropped.
    pub dropped: Vec<MalformedRecord>,
}

/// Parse a snapshot body.
///
/// Only a body that is not JSON at all fails; individual bad entries are
/// collected in [`ParsedSnapshot::dropped`].
pub fn parse_snapshot(body: &str) -> Result<ParsedSnapshot> {
    let trimmed = body.trim_start();
    let mut parsed = ParsedSnapshot::default();

    if trimmed.is_empty() {
        return Ok(parsed);
    }

    if trimmed.starts_with('[') {
        let entries: Vec<serde_json::Value> = serde_json::from_str(trimmed)
            .map_err(|e| Error::MalformedSnapshot(e.to_string()))?;
        for (index, value) in entries.into_iter().enumerate() {
            push_entry(&mut parsed, index, value);
        }
        return Ok(parsed);
    }

    if !trimmed.starts_with('{') {
        return Err(Error::MalformedSnapshot(
            "expected a JSON array or JSON objects".into(),
        ));
    }

    for (index, line) in trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
    {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => push_entry(&mut parsed, index, value),
            Err(e) => parsed.dropped.push(MalformedRecord {
                index,
                facility_key: None,
                reason: e.to_string(),
            }),
        }
    }

    Ok(parsed)
}

fn push_entry(parsed: &mut ParsedSnapshot, index: usize, value: serde_json::Value) {
    match to_record(index, value) {
        Ok(record) => parsed.records.push(record),
        Err(malformed) => parsed.dropped.push(malformed),
    }
}

fn to_record(index: usize, value: serde_json::Value) -> std::result::Result<Record, MalformedRecord> {
    if !value.is_object() {
        return Err(MalformedRecord {
            index,
            facility_key: None,
            reason: "expected a JSON object".into(),
        });
    }

    let entry: FeedEntry = serde_json::from_value(value).map_err(|e| MalformedRecord {
        index,
        facility_key: None,
        reason: e.to_string(),
    })?;

    let facility_key = match entry.identifier {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            return Err(MalformedRecord {
                index,
                facility_key: None,
                reason: "missing facility identifier".into(),
            })
        }
    };

    let Some(available_spaces) = entry.current_value else {
        return Err(MalformedRecord {
            index,
            facility_key: Some(facility_key),
            reason: "missing current value".into(),
        });
    };

    let observed_at = entry
        .date
        .as_ref()
        .and_then(|d| d.as_str())
        .and_then(parse_observed_at);

    Ok(Record {
        facility_key,
        available_spaces,
        closed: entry.closed.unwrap_or(false),
        observed_at,
    })
}

/// Parse a feed timestamp. RFC 3339 is preferred; naive timestamps are
/// taken as UTC.
pub fn parse_observed_at(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lyon_feed_array() {
        let body = r#"[
            {"mv:currentValue": 123, "ferme": false, "Parking_schema:identifier": "LPA0740",
             "Parking_schema:name": "Part-Dieu", "dct:date": "2024-11-05T10:15:00+01:00"},
            {"mv:currentValue": 0, "ferme": true, "Parking_schema:identifier": "LPA0111",
             "Parking_schema:name": "Bellecour", "dct:date": "2024-11-05T10:15:00+01:00"}
        ]"#;

        let parsed = parse_snapshot(body).unwrap();
        assert!(parsed.dropped.is_empty());
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.facility_key, "LPA0740");
        assert_eq!(first.available_spaces, 123);
        assert!(!first.closed);
        assert_eq!(
            first.observed_at.unwrap().to_rfc3339(),
            "2024-11-05T09:15:00+00:00"
        );
        assert!(parsed.records[1].closed);
    }

    #[test]
    fn test_parse_plain_aliases() {
        let body = r#"[{"identifier": "P1", "current_value": 10, "closed": false, "name": "x"}]"#;
        let parsed = parse_snapshot(body).unwrap();
        assert_eq!(parsed.records, vec![Record::new("P1", 10, false)]);
    }

    #[test]
    fn test_malformed_entries_are_dropped_not_fatal() {
        let body = r#"[
            {"Parking_schema:identifier": "P1", "mv:currentValue": 4},
            {"mv:currentValue": 7},
            {"Parking_schema:identifier": "P3"},
            {"Parking_schema:identifier": "P4", "mv:currentValue": "many"},
            {"Parking_schema:identifier": "  ", "mv:currentValue": 1},
            42
        ]"#;

        let parsed = parse_snapshot(body).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].facility_key, "P1");

        let indexes: Vec<_> = parsed.dropped.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.dropped[1].facility_key.as_deref(), Some("P3"));
        assert_eq!(parsed.dropped[1].reason, "missing current value");
    }

    #[test]
    fn test_negative_counts_pass_through() {
        let parsed =
            parse_snapshot(r#"[{"Parking_schema:identifier": "P1", "mv:currentValue": -2}]"#)
                .unwrap();
        assert_eq!(parsed.records[0].available_spaces, -2);
    }

    #[test]
    fn test_parse_json_lines() {
        let body = "{\"identifier\": \"P1\", \"current_value\": 1}\n\
                    not json\n\
                    \n\
                    {\"identifier\": \"P2\", \"current_value\": 2}\n";

        let parsed = parse_snapshot(body).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.dropped.len(), 1);
        assert_eq!(parsed.dropped[0].index, 1);
    }

    #[test]
    fn test_empty_and_garbage_bodies() {
        assert!(parse_snapshot("   ").unwrap().records.is_empty());
        assert!(parse_snapshot("[]").unwrap().records.is_empty());
        assert!(matches!(
            parse_snapshot("<html>502</html>"),
            Err(Error::MalformedSnapshot(_))
        ));
        assert!(matches!(
            parse_snapshot("[{\"truncated\""),
            Err(Error::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn test_parse_observed_at_formats() {
        assert!(parse_observed_at("2024-11-05T10:15:00Z").is_some());
        assert!(parse_observed_at("2024-11-05T10:15:00.250").is_some());
        assert!(parse_observed_at("2024-11-05 10:15:00").is_some());
        assert!(parse_observed_at("yesterday").is_none());
    }

    #[test]
    fn test_unparseable_date_keeps_record() {
        let parsed = parse_snapshot(
            r#"[{"identifier": "P1", "current_value": 3, "date": 1730800000}]"#,
        )
        .unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert!(parsed.records[0].observed_at.is_none());
    }
}
