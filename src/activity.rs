//! Activity aggregation
//!
//! Stateless aggregates over the enriched event table: transaction and
//! subscriber counts, activity shares, travel distance statistics keyed by
//! home region, region diversity, and new-SIM detection.
//!
//! Distance lookups that miss the reference table contribute nothing: a
//! subscriber whose consecutive-pair lookups all miss has a null distance
//! sum and is excluded from the mean, never counted as zero.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::enrichment::by_subscriber;
use crate::error::AggregationError;
use crate::stats;
use crate::types::{CallEvent, DistanceMatrix, Frequency, PeriodFilter};

/// Transaction count per (bucket, region)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionCountRow {
    pub bucket: DateTime<Utc>,
    pub region: Option<String>,
    pub count: u64,
}

/// Unique subscriber count per (bucket, region)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueSubscribersRow {
    pub bucket: DateTime<Utc>,
    pub region: Option<String>,
    pub count: u64,
}

/// Country-wide unique subscriber count per bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryActiveRow {
    pub bucket: DateTime<Utc>,
    pub count: u64,
}

/// Share of the period's active subscribers seen in a bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentActiveRow {
    pub bucket: DateTime<Utc>,
    pub count: u64,
    pub percent_active: f64,
}

/// Distance statistics per (home region, bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanDistanceRow {
    pub bucket: DateTime<Utc>,
    pub home_region: Option<String>,
    pub mean_distance: Option<f64>,
    pub stdev_distance: Option<f64>,
}

/// Median distance per (home region, bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedianDistanceRow {
    pub bucket: DateTime<Utc>,
    pub home_region: Option<String>,
    pub median_distance: Option<f64>,
}

/// Mean distinct regions visited per (home region, bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionsVisitedRow {
    pub bucket: DateTime<Utc>,
    pub home_region: Option<String>,
    pub count: f64,
}

/// Subscribers confined to a single region per (home region, bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleRegionRow {
    pub bucket: DateTime<Utc>,
    pub home_region: Option<String>,
    pub count: u64,
}

/// New-SIM counts per (region, day), with a trailing 28-day rolling total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSimsRow {
    pub day: DateTime<Utc>,
    pub region: Option<String>,
    pub new_sims: u64,
    pub new_sims_month: u64,
}

/// Activity aggregator over the enriched event table
pub struct ActivityAggregator<'a> {
    events: &'a [CallEvent],
    homes: &'a HashMap<String, String>,
    distances: &'a DistanceMatrix,
}

impl<'a> ActivityAggregator<'a> {
    pub fn new(
        events: &'a [CallEvent],
        homes: &'a HashMap<String, String>,
        distances: &'a DistanceMatrix,
    ) -> Self {
        Self {
            events,
            homes,
            distances,
        }
    }

    fn filtered(&self, filter: &PeriodFilter) -> Vec<&'a CallEvent> {
        self.events
            .iter()
            .filter(|e| filter.contains(e.call_datetime))
            .collect()
    }

    fn home_of(&self, subscriber: &str) -> Option<String> {
        self.homes.get(subscriber).cloned()
    }

    /// Transaction count per (bucket, region)
    pub fn transactions(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<TransactionCountRow> {
        let mut counts: BTreeMap<(DateTime<Utc>, Option<String>), u64> = BTreeMap::new();
        for event in self.filtered(filter) {
            *counts
                .entry((event.bucket(frequency), event.region.clone()))
                .or_default() += 1;
        }
        counts
            .into_iter()
            .map(|((bucket, region), count)| TransactionCountRow {
                bucket,
                region,
                count,
            })
            .collect()
    }

    /// Unique subscriber count per (bucket, region)
    pub fn unique_subscribers(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<UniqueSubscribersRow> {
        let mut groups: BTreeMap<(DateTime<Utc>, Option<String>), HashSet<&str>> = BTreeMap::new();
        for event in self.filtered(filter) {
            groups
                .entry((event.bucket(frequency), event.region.clone()))
                .or_default()
                .insert(event.subscriber_id.as_str());
        }
        groups
            .into_iter()
            .map(|((bucket, region), subscribers)| UniqueSubscribersRow {
                bucket,
                region,
                count: subscribers.len() as u64,
            })
            .collect()
    }

    /// Country-wide unique subscriber count per bucket
    pub fn unique_subscribers_country(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<CountryActiveRow> {
        let mut groups: BTreeMap<DateTime<Utc>, HashSet<&str>> = BTreeMap::new();
        for event in self.filtered(filter) {
            groups
                .entry(event.bucket(frequency))
                .or_default()
                .insert(event.subscriber_id.as_str());
        }
        groups
            .into_iter()
            .map(|(bucket, subscribers)| CountryActiveRow {
                bucket,
                count: subscribers.len() as u64,
            })
            .collect()
    }

    /// Share of all subscribers active in the filtered period that were
    /// active in each bucket
    pub fn percent_of_all_subscribers_active(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<PercentActiveRow> {
        let period_active: HashSet<&str> = self
            .filtered(filter)
            .iter()
            .map(|e| e.subscriber_id.as_str())
            .collect();
        let denominator = period_active.len() as f64;

        self.unique_subscribers_country(filter, frequency)
            .into_iter()
            .map(|row| PercentActiveRow {
                bucket: row.bucket,
                count: row.count,
                percent_active: row.count as f64 / denominator,
            })
            .collect()
    }

    /// Per-(subscriber, bucket) distance sums: the summed distance between
    /// each consecutive pair of in-filter events, keyed onto the
    /// subscriber's home region. `None` when no pair matched the distance
    /// table.
    fn distance_sums(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> BTreeMap<(Option<String>, DateTime<Utc>), Vec<Option<f64>>> {
        let filtered = self.filtered(filter);
        let mut groups: BTreeMap<(Option<String>, DateTime<Utc>), Vec<Option<f64>>> =
            BTreeMap::new();

        for (subscriber, subscriber_events) in by_subscriber(filtered.iter().copied()) {
            let home = self.home_of(subscriber);
            // (bucket) -> (matched sum, matched count)
            let mut sums: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
            let mut previous_location: Option<&str> = None;
            for event in &subscriber_events {
                let bucket = event.bucket(frequency);
                let entry = sums.entry(bucket).or_insert((0.0, 0));
                if let Some(origin) = previous_location {
                    if let Some(distance) = self.distances.lookup(origin, &event.location_id) {
                        entry.0 += distance;
                        entry.1 += 1;
                    }
                }
                previous_location = Some(event.location_id.as_str());
            }
            for (bucket, (sum, matched)) in sums {
                let value = if matched > 0 { Some(sum) } else { None };
                groups.entry((home.clone(), bucket)).or_default().push(value);
            }
        }
        groups
    }

    /// Mean and population stddev of per-subscriber distance sums per
    /// (home region, bucket)
    pub fn mean_distance(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<MeanDistanceRow> {
        self.distance_sums(filter, frequency)
            .into_iter()
            .map(|((home_region, bucket), sums)| {
                let values: Vec<f64> = sums.into_iter().flatten().collect();
                MeanDistanceRow {
                    bucket,
                    home_region,
                    mean_distance: stats::mean(&values),
                    stdev_distance: stats::stddev_pop(&values),
                }
            })
            .collect()
    }

    /// Median of per-subscriber distance sums per (home region, bucket)
    pub fn median_distance(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<MedianDistanceRow> {
        self.distance_sums(filter, frequency)
            .into_iter()
            .map(|((home_region, bucket), sums)| {
                let values: Vec<f64> = sums.into_iter().flatten().collect();
                MedianDistanceRow {
                    bucket,
                    home_region,
                    median_distance: stats::median(&values),
                }
            })
            .collect()
    }

    /// Distinct non-null regions visited per (subscriber, bucket)
    fn regions_visited(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> BTreeMap<(Option<String>, DateTime<Utc>), Vec<(String, u64)>> {
        let filtered = self.filtered(filter);
        let mut groups: BTreeMap<(Option<String>, DateTime<Utc>), Vec<(String, u64)>> =
            BTreeMap::new();

        for (subscriber, subscriber_events) in by_subscriber(filtered.iter().copied()) {
            let home = self.home_of(subscriber);
            let mut per_bucket: BTreeMap<DateTime<Utc>, HashSet<&str>> = BTreeMap::new();
            for event in &subscriber_events {
                let regions = per_bucket.entry(event.bucket(frequency)).or_default();
                if let Some(region) = event.region.as_deref() {
                    regions.insert(region);
                }
            }
            for (bucket, regions) in per_bucket {
                groups
                    .entry((home.clone(), bucket))
                    .or_default()
                    .push((subscriber.to_string(), regions.len() as u64));
            }
        }
        groups
    }

    /// Mean distinct regions visited per subscriber, per (home region,
    /// bucket)
    pub fn different_areas_visited(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<RegionsVisitedRow> {
        self.regions_visited(filter, frequency)
            .into_iter()
            .filter_map(|((home_region, bucket), visits)| {
                let counts: Vec<f64> = visits.iter().map(|(_, n)| *n as f64).collect();
                stats::mean(&counts).map(|count| RegionsVisitedRow {
                    bucket,
                    home_region,
                    count,
                })
            })
            .collect()
    }

    /// Count of subscribers whose distinct-region count is exactly one,
    /// per (home region, bucket)
    pub fn only_in_one_region(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<SingleRegionRow> {
        self.regions_visited(filter, frequency)
            .into_iter()
            .filter_map(|((home_region, bucket), visits)| {
                let confined: HashSet<&str> = visits
                    .iter()
                    .filter(|(_, n)| *n == 1)
                    .map(|(subscriber, _)| subscriber.as_str())
                    .collect();
                if confined.is_empty() {
                    None
                } else {
                    Some(SingleRegionRow {
                        bucket,
                        home_region,
                        count: confined.len() as u64,
                    })
                }
            })
            .collect()
    }

    /// New-SIM detection: a subscriber counts as new on the first day they
    /// appear, and only when that first day holds a single event (the
    /// cumulative event count over days up to and including it equals
    /// one). Daily totals carry a trailing 28-day rolling sum per region.
    ///
    /// Only defined at daily frequency; any other frequency is a
    /// configuration error.
    pub fn new_sims(
        &self,
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Result<Vec<NewSimsRow>, AggregationError> {
        if frequency != Frequency::Day {
            return Err(AggregationError::UnsupportedFrequency {
                indicator: "new_sims",
                frequency,
            });
        }

        let filtered = self.filtered(filter);

        // Sum of new-SIM flags per (region, day), over every observed group
        let mut daily: BTreeMap<(Option<String>, DateTime<Utc>), u64> = BTreeMap::new();
        for event in &filtered {
            daily.entry((event.region.clone(), event.day)).or_default();
        }
        for (_, subscriber_events) in by_subscriber(filtered.iter().copied()) {
            let Some(first_day) = subscriber_events.iter().map(|e| e.day).min() else {
                continue;
            };
            let first_day_events: Vec<&&CallEvent> = subscriber_events
                .iter()
                .filter(|e| e.day == first_day)
                .collect();
            if first_day_events.len() == 1 {
                let event = first_day_events[0];
                *daily.entry((event.region.clone(), event.day)).or_default() += 1;
            }
        }

        // Trailing 28-day rolling sum per region
        let mut per_region: BTreeMap<Option<String>, Vec<(DateTime<Utc>, u64)>> = BTreeMap::new();
        for ((region, day), new_sims) in &daily {
            per_region
                .entry(region.clone())
                .or_default()
                .push((*day, *new_sims));
        }

        let mut rows = Vec::new();
        for (region, days) in per_region {
            for (i, (day, new_sims)) in days.iter().enumerate() {
                let window_start = *day - Duration::days(28);
                let rolling: u64 = days[..=i]
                    .iter()
                    .filter(|(d, _)| *d >= window_start)
                    .map(|(_, n)| *n)
                    .sum();
                rows.push(NewSimsRow {
                    day: *day,
                    region: region.clone(),
                    new_sims: *new_sims,
                    new_sims_month: rolling,
                });
            }
        }
        rows.sort_by(|a, b| (&a.region, a.day).cmp(&(&b.region, b.day)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{CellRegionMap, EventEnrichment};
    use crate::schema::RawCallRecord;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

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
        cells.insert("c1", "north");
        cells.insert("c2", "north");
        cells.insert("c3", "south");
        cells
    }

    fn march_filter() -> PeriodFilter {
        PeriodFilter::new(ts(1, 0, 0), ts(31, 23, 59))
    }

    fn no_homes() -> HashMap<String, String> {
        HashMap::new()
    }

    fn no_distances() -> DistanceMatrix {
        DistanceMatrix::new()
    }

    #[test]
    fn test_transactions_keep_null_region_group() {
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 9, 0), "c2"),
            record("b", ts(2, 10, 0), "unmapped"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let homes = no_homes();
        let distances = no_distances();
        let rows = ActivityAggregator::new(&events, &homes, &distances)
            .transactions(&march_filter(), Frequency::Day);

        assert_eq!(rows.len(), 2);
        // Null region sorts first
        assert_eq!(rows[0].region, None);
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[1].region.as_deref(), Some("north"));
        assert_eq!(rows[1].count, 2);
    }

    #[test]
    fn test_unique_subscribers_by_region_and_country() {
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 9, 0), "c1"),
            record("a", ts(2, 10, 0), "c3"),
            record("b", ts(2, 11, 0), "c3"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let homes = no_homes();
        let distances = no_distances();
        let aggregator = ActivityAggregator::new(&events, &homes, &distances);

        let regional = aggregator.unique_subscribers(&march_filter(), Frequency::Day);
        assert_eq!(regional.len(), 2);
        let north = regional
            .iter()
            .find(|r| r.region.as_deref() == Some("north"))
            .unwrap();
        let south = regional
            .iter()
            .find(|r| r.region.as_deref() == Some("south"))
            .unwrap();
        assert_eq!(north.count, 1);
        assert_eq!(south.count, 2);

        let country = aggregator.unique_subscribers_country(&march_filter(), Frequency::Day);
        assert_eq!(country.len(), 1);
        assert_eq!(country[0].count, 2);
    }

    #[test]
    fn test_percent_active_uses_period_denominator() {
        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("b", ts(2, 9, 0), "c1"),
            record("a", ts(3, 8, 0), "c1"),
            record("c", ts(3, 9, 0), "c3"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let homes = no_homes();
        let distances = no_distances();
        let rows = ActivityAggregator::new(&events, &homes, &distances)
            .percent_of_all_subscribers_active(&march_filter(), Frequency::Day);

        // Three subscribers active in the period; 2 on day 2, 2 on day 3
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.count, 2);
            assert!((row.percent_active - 2.0 / 3.0).abs() < 1e-12);
            assert!(row.percent_active <= 1.0);
        }
    }

    #[test]
    fn test_mean_distance_excludes_unmatched_pairs() {
        let mut distances = DistanceMatrix::new();
        distances.insert("c1", "c3", 40.0);
        distances.insert("c3", "c1", 40.0);

        let mut homes = HashMap::new();
        homes.insert("a".to_string(), "north".to_string());
        homes.insert("b".to_string(), "north".to_string());

        let records = vec![
            // a: two matched hops of 40
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 10, 0), "c3"),
            record("a", ts(2, 12, 0), "c1"),
            // b: one hop with no distance entry; excluded, not zero
            record("b", ts(2, 9, 0), "c1"),
            record("b", ts(2, 11, 0), "c2"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let rows = ActivityAggregator::new(&events, &homes, &distances)
            .mean_distance(&march_filter(), Frequency::Day);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].home_region.as_deref(), Some("north"));
        assert_eq!(rows[0].mean_distance, Some(80.0));
        assert_eq!(rows[0].stdev_distance, Some(0.0));
    }

    #[test]
    fn test_median_distance() {
        let mut distances = DistanceMatrix::new();
        distances.insert("c1", "c3", 10.0);
        distances.insert("c3", "c1", 30.0);

        let mut homes = HashMap::new();
        for s in ["a", "b", "c"] {
            homes.insert(s.to_string(), "north".to_string());
        }

        let records = vec![
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 9, 0), "c3"),
            record("b", ts(2, 8, 0), "c3"),
            record("b", ts(2, 9, 0), "c1"),
            record("c", ts(2, 8, 0), "c1"),
            record("c", ts(2, 9, 0), "c3"),
            record("c", ts(2, 10, 0), "c1"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let rows = ActivityAggregator::new(&events, &homes, &distances)
            .median_distance(&march_filter(), Frequency::Day);

        // Sums: a=10, b=30, c=40 → median 30
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].median_distance, Some(30.0));
    }

    #[test]
    fn test_region_diversity_and_confinement() {
        let mut homes = HashMap::new();
        homes.insert("a".to_string(), "north".to_string());
        homes.insert("b".to_string(), "north".to_string());

        let records = vec![
            // a visits north and south
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(2, 10, 0), "c3"),
            // b stays in north
            record("b", ts(2, 9, 0), "c1"),
            record("b", ts(2, 11, 0), "c2"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let distances = no_distances();
        let aggregator = ActivityAggregator::new(&events, &homes, &distances);

        let visited = aggregator.different_areas_visited(&march_filter(), Frequency::Day);
        assert_eq!(visited.len(), 1);
        assert!((visited[0].count - 1.5).abs() < 1e-12);

        let confined = aggregator.only_in_one_region(&march_filter(), Frequency::Day);
        assert_eq!(confined.len(), 1);
        assert_eq!(confined[0].count, 1);
    }

    #[test]
    fn test_new_sims_rejects_non_daily_frequency() {
        let events = EventEnrichment::enrich(vec![], &make_cells());
        let homes = no_homes();
        let distances = no_distances();
        let result = ActivityAggregator::new(&events, &homes, &distances)
            .new_sims(&march_filter(), Frequency::Week);
        assert!(matches!(
            result,
            Err(AggregationError::UnsupportedFrequency { .. })
        ));
    }

    #[test]
    fn test_new_sims_flags_single_first_day_event() {
        let records = vec![
            // a: single event on its first day → new
            record("a", ts(2, 8, 0), "c1"),
            record("a", ts(5, 8, 0), "c1"),
            // b: two events on its first day → never flagged
            record("b", ts(3, 8, 0), "c1"),
            record("b", ts(3, 9, 0), "c1"),
            // c: new on day 5
            record("c", ts(5, 10, 0), "c1"),
        ];
        let events = EventEnrichment::enrich(records, &make_cells());
        let homes = no_homes();
        let distances = no_distances();
        let rows = ActivityAggregator::new(&events, &homes, &distances)
            .new_sims(&march_filter(), Frequency::Day)
            .unwrap();

        let north: Vec<_> = rows
            .iter()
            .filter(|r| r.region.as_deref() == Some("north"))
            .collect();
        assert_eq!(north.len(), 3);

        assert_eq!(north[0].day, ts(2, 0, 0));
        assert_eq!(north[0].new_sims, 1);
        assert_eq!(north[0].new_sims_month, 1);

        assert_eq!(north[1].day, ts(3, 0, 0));
        assert_eq!(north[1].new_sims, 0);
        assert_eq!(north[1].new_sims_month, 1);

        // Day 5: one new subscriber, rolling total now 2
        assert_eq!(north[2].day, ts(5, 0, 0));
        assert_eq!(north[2].new_sims, 1);
        assert_eq!(north[2].new_sims_month, 2);
    }
}
