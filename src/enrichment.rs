//! Event enrichment
//!
//! First stage of the pipeline: joins standardized call records to the
//! cell→region mapping and derives the per-subscriber sequential columns
//! every aggregator depends on.
//!
//! The join is a left join: events on unmapped cells are kept with a null
//! region, never dropped. Ordering is established exactly once, by
//! `(subscriber_id, call_datetime)` with a stable sort, and all lag/lead
//! columns are computed against that single ordering.

use chrono::Timelike;
use std::collections::HashMap;

use crate::schema::{CellMapping, RawCallRecord};
use crate::types::{CallEvent, Frequency};

/// Cell identifier → region lookup
#[derive(Debug, Clone, Default)]
pub struct CellRegionMap {
    regions: HashMap<String, String>,
}

impl CellRegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mappings(mappings: &[CellMapping]) -> Self {
        let mut map = Self::new();
        for mapping in mappings {
            map.insert(mapping.cell_id.clone(), mapping.region.clone());
        }
        map
    }

    pub fn insert(&mut self, cell_id: impl Into<String>, region: impl Into<String>) {
        self.regions.insert(cell_id.into(), region.into());
    }

    pub fn region_of(&self, cell_id: &str) -> Option<&str> {
        self.regions.get(cell_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Enrichment stage for raw call records
pub struct EventEnrichment;

impl EventEnrichment {
    /// Produce the enriched event table.
    ///
    /// The sort is stable, so records with equal timestamps keep their
    /// ingestion order and lag/lead assignment is deterministic for a
    /// given input.
    pub fn enrich(mut records: Vec<RawCallRecord>, cells: &CellRegionMap) -> Vec<CallEvent> {
        records.sort_by(|a, b| {
            a.subscriber_id
                .cmp(&b.subscriber_id)
                .then(a.call_datetime.cmp(&b.call_datetime))
        });

        let mut events: Vec<CallEvent> = records
            .into_iter()
            .map(|record| {
                let region = cells.region_of(&record.location_id).map(str::to_string);
                CallEvent {
                    call_date: record.call_datetime.date_naive(),
                    region,
                    region_lag: None,
                    region_lead: None,
                    call_datetime_lag: None,
                    call_datetime_lead: None,
                    hour_of_day: record.call_datetime.hour() as u8,
                    hour: Frequency::Hour.truncate(record.call_datetime),
                    day: Frequency::Day.truncate(record.call_datetime),
                    week: Frequency::Week.truncate(record.call_datetime),
                    month: Frequency::Month.truncate(record.call_datetime),
                    subscriber_id: record.subscriber_id,
                    call_datetime: record.call_datetime,
                    location_id: record.location_id,
                }
            })
            .collect();

        for i in 1..events.len() {
            let (left, right) = events.split_at_mut(i);
            let prev = &mut left[i - 1];
            let curr = &mut right[0];
            if curr.subscriber_id == prev.subscriber_id {
                curr.region_lag = prev.region.clone();
                curr.call_datetime_lag = Some(prev.call_datetime);
                prev.region_lead = curr.region.clone();
                prev.call_datetime_lead = Some(curr.call_datetime);
            }
        }

        events
    }
}

/// Group events by subscriber, preserving the enriched per-subscriber
/// ordering within each group. Keyed deterministically.
pub fn by_subscriber<'a, I>(events: I) -> std::collections::BTreeMap<&'a str, Vec<&'a CallEvent>>
where
    I: IntoIterator<Item = &'a CallEvent>,
{
    let mut groups: std::collections::BTreeMap<&'a str, Vec<&'a CallEvent>> =
        std::collections::BTreeMap::new();
    for event in events {
        groups
            .entry(event.subscriber_id.as_str())
            .or_default()
            .push(event);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 3, d, h, m, 0).unwrap()
    }

    fn record(subscriber: &str, datetime: DateTime<Utc>, cell: &str) -> RawCallRecord {
        RawCallRecord {
            subscriber_id: subscriber.to_string(),
            call_datetime: datetime,
            location_id: cell.to_string(),
        }
    }

    fn make_cells() -> CellRegionMap {
        let mut cells = CellRegionMap::new();
        cells.insert("c1", "x");
        cells.insert("c2", "x");
        cells.insert("c3", "y");
        cells
    }

    #[test]
    fn test_lag_lead_sequences() {
        // Three events for one subscriber: region x, x, y
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 12, 0), "c2"),
            record("a", ts(3, 9, 0), "c3"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());

        let lags: Vec<Option<&str>> = events.iter().map(|e| e.region_lag.as_deref()).collect();
        let leads: Vec<Option<&str>> = events.iter().map(|e| e.region_lead.as_deref()).collect();
        assert_eq!(lags, vec![None, Some("x"), Some("x")]);
        assert_eq!(leads, vec![Some("x"), Some("y"), None]);

        assert_eq!(events[1].call_datetime_lag, Some(ts(2, 8, 0)));
        assert_eq!(events[1].call_datetime_lead, Some(ts(3, 9, 0)));
    }

    #[test]
    fn test_boundary_rows_match_subscriber_count() {
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 9, 0), "c2"),
            record("b", ts(2, 10, 0), "c3"),
            record("c", ts(2, 11, 0), "c1"),
            record("c", ts(3, 11, 0), "c1"),
            record("c", ts(4, 11, 0), "c3"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());

        let subscribers: HashSet<&str> =
            events.iter().map(|e| e.subscriber_id.as_str()).collect();
        let null_lags = events.iter().filter(|e| e.is_sequence_start()).count();
        let null_leads = events.iter().filter(|e| e.is_sequence_end()).count();

        assert_eq!(null_lags, subscribers.len());
        assert_eq!(null_leads, subscribers.len());
    }

    #[test]
    fn test_unmapped_cell_keeps_event_with_null_region() {
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 9, 0), "unknown-cell"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].region, None);
        // The null region still propagates into the neighbor's lead column
        assert_eq!(events[0].region_lead, None);
        assert_eq!(events[0].call_datetime_lead, Some(ts(2, 9, 0)));
    }

    #[test]
    fn test_single_ordering_for_all_lag_columns() {
        // Input arrives out of order; lag region and lag timestamp must both
        // come from the same neighbor after sorting.
        let records = vec![
            record("a", ts(3, 9, 0), "c3"),
            record("a", ts(2, 8, 0), "c1"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());

        assert_eq!(events[0].call_datetime, ts(2, 8, 0));
        assert_eq!(events[1].region_lag.as_deref(), Some("x"));
        assert_eq!(events[1].call_datetime_lag, Some(ts(2, 8, 0)));
    }

    #[test]
    fn test_calendar_columns() {
        let records = vec![record("a", ts(17, 14, 35), "c1")];
        let events = EventEnrichment::enrich(records, &make_cells());

        let e = &events[0];
        assert_eq!(e.hour_of_day, 14);
        assert_eq!(e.hour, ts(17, 14, 0));
        assert_eq!(e.day, ts(17, 0, 0));
        // 2020-03-17 is a Tuesday
        assert_eq!(e.week, ts(16, 0, 0));
        assert_eq!(e.month, Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap());
    }
}
