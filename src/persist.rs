//! Result persistence
//!
//! The engine does not own storage layout. It requires only a sink with
//! two operations: check whether a logical name already has an output, and
//! persist a result under a logical name unless one exists. Re-running
//! against a populated sink therefore skips recomputation instead of
//! overwriting; recomputation is the expensive part, not the write.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AggregationError;
use crate::types::IndicatorResult;

/// Persistence contract for indicator results
pub trait ResultSink {
    /// Whether an output already exists under the logical name
    fn exists(&self, name: &str) -> bool;

    /// Persist the result under its logical name. Returns `true` when an
    /// output already existed and nothing was written.
    fn persist(&mut self, result: &IndicatorResult) -> Result<bool, AggregationError>;
}

/// In-memory sink, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, IndicatorResult>,
    writes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&IndicatorResult> {
        self.tables.get(name)
    }

    /// Number of actual writes performed
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl ResultSink for MemorySink {
    fn exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn persist(&mut self, result: &IndicatorResult) -> Result<bool, AggregationError> {
        if self.exists(&result.name) {
            return Ok(true);
        }
        self.tables.insert(result.name.clone(), result.clone());
        self.writes += 1;
        Ok(false)
    }
}

/// Directory sink writing one NDJSON file per logical name
#[derive(Debug, Clone)]
pub struct NdjsonDirSink {
    dir: PathBuf,
}

impl NdjsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.ndjson", name))
    }

    fn persist_error(name: &str, e: impl std::fmt::Display) -> AggregationError {
        AggregationError::PersistError {
            name: name.to_string(),
            reason: e.to_string(),
        }
    }
}

impl ResultSink for NdjsonDirSink {
    fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    fn persist(&mut self, result: &IndicatorResult) -> Result<bool, AggregationError> {
        if self.exists(&result.name) {
            return Ok(true);
        }
        if !Path::new(&self.dir).exists() {
            fs::create_dir_all(&self.dir).map_err(|e| Self::persist_error(&result.name, e))?;
        }
        let ndjson = result.to_ndjson()?;
        fs::write(self.path_for(&result.name), ndjson)
            .map_err(|e| Self::persist_error(&result.name, e))?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_result(name: &str, value: u64) -> IndicatorResult {
        IndicatorResult {
            name: name.to_string(),
            rows: vec![json!({"region": "north", "count": value})],
        }
    }

    #[test]
    fn test_memory_sink_skips_existing() {
        let mut sink = MemorySink::new();

        let first = sink.persist(&make_result("transactions_per_day", 1)).unwrap();
        assert!(!first);
        assert!(sink.exists("transactions_per_day"));

        // Second persist under the same name is a no-op skip
        let second = sink.persist(&make_result("transactions_per_day", 99)).unwrap();
        assert!(second);
        assert_eq!(sink.writes(), 1);
        assert_eq!(
            sink.get("transactions_per_day").unwrap().rows[0]["count"],
            json!(1)
        );
    }

    #[test]
    fn test_ndjson_dir_sink_roundtrip() {
        let dir = std::env::temp_dir().join(format!("cdrind-sink-{}", uuid::Uuid::new_v4()));
        let mut sink = NdjsonDirSink::new(&dir);

        assert!(!sink.exists("unique_subscribers_per_hour"));
        let existed = sink
            .persist(&make_result("unique_subscribers_per_hour", 7))
            .unwrap();
        assert!(!existed);
        assert!(sink.exists("unique_subscribers_per_hour"));

        let content = fs::read_to_string(sink.path_for("unique_subscribers_per_hour")).unwrap();
        assert!(content.contains("north"));

        // Existing file wins over a re-run
        let existed = sink
            .persist(&make_result("unique_subscribers_per_hour", 8))
            .unwrap();
        assert!(existed);

        fs::remove_dir_all(&dir).unwrap();
    }
}
