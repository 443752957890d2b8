//! Input record schemas and loaders
//!
//! The engine consumes already-standardized tables produced by external
//! collaborators: the call record stream, the cell→region mapping, the
//! region-pair distance table and the incidence reference table. This
//! module defines those row schemas, NDJSON/array loaders, and record
//! validation with per-record error reporting.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use crate::types::{DistanceMatrix, IncidenceTable};

/// One standardized call record, before enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCallRecord {
    pub subscriber_id: String,
    pub call_datetime: DateTime<Utc>,
    pub location_id: String,
}

impl RawCallRecord {
    /// Validate the record fields
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.subscriber_id.trim().is_empty() {
            return Err(ValidationError::EmptySubscriberId);
        }
        if self.location_id.trim().is_empty() {
            return Err(ValidationError::EmptyLocationId);
        }
        Ok(())
    }
}

/// Validation errors for raw call records
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("subscriber_id is empty")]
    EmptySubscriberId,

    #[error("location_id is empty")]
    EmptyLocationId,
}

/// One cell→region mapping row (tower clustering collaborator output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellMapping {
    pub cell_id: String,
    pub region: String,
}

/// One directed distance row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceRecord {
    pub origin: String,
    pub destination: String,
    pub distance: f64,
}

/// One region incidence row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidenceRecord {
    pub region: String,
    pub incidence: f64,
}

/// Loader for NDJSON and JSON-array input tables
pub struct RecordLoader;

impl RecordLoader {
    /// Parse a JSON string containing an array of records
    pub fn parse_array<T: DeserializeOwned>(json: &str) -> Result<Vec<T>, AggregationError> {
        let records: Vec<T> = serde_json::from_str(json)?;
        Ok(records)
    }

    /// Parse NDJSON (newline-delimited JSON), skipping blank lines
    pub fn parse_ndjson<T: DeserializeOwned>(ndjson: &str) -> Result<Vec<T>, AggregationError> {
        let mut records = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    return Err(AggregationError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(records)
    }
}

/// A record that failed validation, with its position in the input
#[derive(Debug, Clone, Serialize)]
pub struct InvalidRecord {
    pub index: usize,
    pub subscriber_id: String,
    pub error: String,
}

/// Validate a batch of call records, returning the failures
pub fn validate_records(records: &[RawCallRecord]) -> Vec<InvalidRecord> {
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            record.validate().err().map(|e| InvalidRecord {
                index,
                subscriber_id: record.subscriber_id.clone(),
                error: e.to_string(),
            })
        })
        .collect()
}

/// Build the distance lookup from its rows
pub fn distance_matrix(records: &[DistanceRecord]) -> DistanceMatrix {
    let mut matrix = DistanceMatrix::new();
    for record in records {
        matrix.insert(record.origin.clone(), record.destination.clone(), record.distance);
    }
    matrix
}

/// Build the incidence lookup from its rows
pub fn incidence_table(records: &[IncidenceRecord]) -> IncidenceTable {
    let mut table = IncidenceTable::new();
    for record in records {
        table.insert(record.region.clone(), record.incidence);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ndjson_skips_blank_lines() {
        let ndjson = r#"
{"subscriber_id": "a", "call_datetime": "2020-02-03T08:00:00Z", "location_id": "c1"}

{"subscriber_id": "b", "call_datetime": "2020-02-03T09:00:00Z", "location_id": "c2"}
"#;
        let records: Vec<RawCallRecord> = RecordLoader::parse_ndjson(ndjson).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subscriber_id, "a");
        assert_eq!(records[1].location_id, "c2");
    }

    #[test]
    fn test_parse_ndjson_reports_line_number() {
        let ndjson = "{\"subscriber_id\": \"a\", \"call_datetime\": \"2020-02-03T08:00:00Z\", \"location_id\": \"c1\"}\nnot json\n";
        let result: Result<Vec<RawCallRecord>, _> = RecordLoader::parse_ndjson(ndjson);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_array() {
        let json = r#"[{"origin": "c1", "destination": "c2", "distance": 42.0}]"#;
        let records: Vec<DistanceRecord> = RecordLoader::parse_array(json).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].distance, 42.0);
    }

    #[test]
    fn test_validate_records() {
        let records = vec![
            RawCallRecord {
                subscriber_id: "a".to_string(),
                call_datetime: "2020-02-03T08:00:00Z".parse().unwrap(),
                location_id: "c1".to_string(),
            },
            RawCallRecord {
                subscriber_id: "".to_string(),
                call_datetime: "2020-02-03T09:00:00Z".parse().unwrap(),
                location_id: "c2".to_string(),
            },
        ];

        let invalid = validate_records(&records);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].index, 1);
        assert!(invalid[0].error.contains("subscriber_id"));
    }

    #[test]
    fn test_reference_table_builders() {
        let distances = distance_matrix(&[DistanceRecord {
            origin: "c1".to_string(),
            destination: "c2".to_string(),
            distance: 10.0,
        }]);
        assert_eq!(distances.lookup("c1", "c2"), Some(10.0));

        let incidence = incidence_table(&[IncidenceRecord {
            region: "north".to_string(),
            incidence: 0.02,
        }]);
        assert_eq!(incidence.rate("north"), Some(0.02));
        assert_eq!(incidence.rate("south"), None);
    }
}
