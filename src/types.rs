//! Core types for the indicator aggregation engine
//!
//! This module defines the data structures shared by every aggregator:
//! time-bucket frequencies, enriched call events, the external reference
//! tables (distances, incidence), and the named result tables handed to
//! the persistence sink.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::AggregationError;

/// Time granularity for bucketed indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hour,
    Day,
    Week,
    Month,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hour => "hour",
            Frequency::Day => "day",
            Frequency::Week => "week",
            Frequency::Month => "month",
        }
    }

    /// All frequencies, in registry order
    pub fn all() -> [Frequency; 4] {
        [
            Frequency::Hour,
            Frequency::Day,
            Frequency::Week,
            Frequency::Month,
        ]
    }

    /// Truncate a timestamp to the start of its bucket. Weeks start on Monday.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Frequency::Hour => day_start(date) + Duration::hours(i64::from(ts.hour())),
            Frequency::Day => day_start(date),
            Frequency::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                day_start(date - Duration::days(back))
            }
            Frequency::Month => day_start(date.with_day(1).unwrap_or(date)),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// One enriched call event.
///
/// Lag/lead fields refer to the previous/next event of the same subscriber
/// under the single per-subscriber ordering established by enrichment; they
/// are `None` at sequence boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub subscriber_id: String,
    pub call_datetime: DateTime<Utc>,
    pub call_date: NaiveDate,
    pub location_id: String,
    /// Region resolved from the cell mapping; `None` for unmapped cells
    pub region: Option<String>,
    pub region_lag: Option<String>,
    pub region_lead: Option<String>,
    pub call_datetime_lag: Option<DateTime<Utc>>,
    pub call_datetime_lead: Option<DateTime<Utc>>,
    /// Hour of day, 0-23
    pub hour_of_day: u8,
    pub hour: DateTime<Utc>,
    pub day: DateTime<Utc>,
    pub week: DateTime<Utc>,
    pub month: DateTime<Utc>,
}

impl CallEvent {
    /// The precomputed bucket start for the given frequency
    pub fn bucket(&self, frequency: Frequency) -> DateTime<Utc> {
        match frequency {
            Frequency::Hour => self.hour,
            Frequency::Day => self.day,
            Frequency::Week => self.week,
            Frequency::Month => self.month,
        }
    }

    /// True for the first event of a subscriber's sequence
    pub fn is_sequence_start(&self) -> bool {
        self.call_datetime_lag.is_none()
    }

    /// True for the last event of a subscriber's sequence
    pub fn is_sequence_end(&self) -> bool {
        self.call_datetime_lead.is_none()
    }

    /// Midpoint-weighted dwell duration in seconds: half the gap to the
    /// previous event plus half the gap to the next event of the same
    /// subscriber. `None` at sequence boundaries, where one of the gaps is
    /// undefined.
    pub fn midpoint_duration(&self) -> Option<f64> {
        let lag = self.call_datetime_lag?;
        let lead = self.call_datetime_lead?;
        let half_before = (self.call_datetime.timestamp() - lag.timestamp()) as f64 / 2.0;
        let half_after = (lead.timestamp() - self.call_datetime.timestamp()) as f64 / 2.0;
        Some(half_before + half_after)
    }
}

/// Inclusive `[start, end]` filter on event timestamps
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeriodFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodFilter {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Directed origin→destination distance table, keyed by location identifier
#[derive(Debug, Clone, Default)]
pub struct DistanceMatrix {
    distances: HashMap<(String, String), f64>,
}

impl DistanceMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, origin: impl Into<String>, destination: impl Into<String>, distance: f64) {
        self.distances
            .insert((origin.into(), destination.into()), distance);
    }

    /// Look up the directed distance; `None` when the pair is unknown
    pub fn lookup(&self, origin: &str, destination: &str) -> Option<f64> {
        self.distances
            .get(&(origin.to_string(), destination.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.distances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distances.is_empty()
    }
}

/// Region → incidence rate reference table
#[derive(Debug, Clone, Default)]
pub struct IncidenceTable {
    rates: HashMap<String, f64>,
}

impl IncidenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: impl Into<String>, incidence: f64) {
        self.rates.insert(region.into(), incidence);
    }

    /// Incidence rate for a region; `None` when the region has no entry
    pub fn rate(&self, region: &str) -> Option<f64> {
        self.rates.get(region).copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// A named, time-bucketed aggregate table produced by one indicator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorResult {
    /// Logical name, e.g. `transactions_per_day`
    pub name: String,
    pub rows: Vec<serde_json::Value>,
}

impl IndicatorResult {
    /// Build a result table from typed rows
    pub fn from_rows<T: Serialize>(
        name: impl Into<String>,
        rows: &[T],
    ) -> Result<Self, AggregationError> {
        let rows = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            rows,
        })
    }

    /// Encode rows as newline-delimited JSON
    pub fn to_ndjson(&self) -> Result<String, AggregationError> {
        let mut lines = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            lines.push(serde_json::to_string(row)?);
        }
        Ok(lines.join("\n") + "\n")
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The logical output name for an indicator at a frequency
pub fn logical_name(indicator: &str, frequency: Frequency) -> String {
    format!("{}_per_{}", indicator, frequency.as_str())
}
