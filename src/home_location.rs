//! Home location inference
//!
//! Assigns each subscriber a "home" region per time bucket: the region
//! that most often held the subscriber's last event of the day. The modal
//! count decides; ties fall to the region with the most recent qualifying
//! day, then to the lexicographically greatest region, so the outcome does
//! not depend on input row order. Days whose last event has no region do
//! not vote.
//!
//! Output is sparse: a subscriber with no qualifying events in a bucket
//! gets no row. Assignments can be serialized and re-loaded so an earlier
//! run's homes can be re-used instead of recomputed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::enrichment::by_subscriber;
use crate::types::{CallEvent, Frequency, PeriodFilter};

/// One home location assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeLocation {
    pub subscriber_id: String,
    pub bucket: DateTime<Utc>,
    pub home_region: String,
}

/// Census row: subscribers per (bucket, home region)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeLocationCountRow {
    pub bucket: DateTime<Utc>,
    pub home_region: String,
    pub count: u64,
}

/// Cross-tab row: where subscribers spend their days versus where they live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayVsHomeRow {
    pub bucket: DateTime<Utc>,
    pub region: String,
    pub home_region: Option<String>,
    pub count: u64,
}

/// Home location resolver
pub struct HomeLocationResolver;

impl HomeLocationResolver {
    /// Assign a home region per (subscriber, bucket) at the given frequency
    pub fn assign(
        events: &[CallEvent],
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<HomeLocation> {
        Self::vote(events, filter, |event| event.bucket(frequency))
    }

    /// Assign one home region per subscriber across the whole filtered
    /// period, for joining onto events as `home_region`
    pub fn assign_period(events: &[CallEvent], filter: &PeriodFilter) -> HashMap<String, String> {
        let bucket = filter.start;
        Self::vote(events, filter, |_| bucket)
            .into_iter()
            .map(|home| (home.subscriber_id, home.home_region))
            .collect()
    }

    fn vote<F>(events: &[CallEvent], filter: &PeriodFilter, bucket_of: F) -> Vec<HomeLocation>
    where
        F: Fn(&CallEvent) -> DateTime<Utc>,
    {
        let filtered: Vec<&CallEvent> = events
            .iter()
            .filter(|e| filter.contains(e.call_datetime))
            .collect();

        let mut assignments = Vec::new();
        for (subscriber, subscriber_events) in by_subscriber(filtered.iter().copied()) {
            // Last timestamp per calendar day; every event at that timestamp
            // casts a vote for its region.
            let mut day_last: HashMap<NaiveDate, DateTime<Utc>> = HashMap::new();
            for &event in &subscriber_events {
                let last = day_last.entry(event.call_date).or_insert(event.call_datetime);
                if event.call_datetime > *last {
                    *last = event.call_datetime;
                }
            }

            // (bucket, region) -> (vote count, most recent voting day)
            let mut votes: BTreeMap<(DateTime<Utc>, String), (u64, NaiveDate)> = BTreeMap::new();
            for &event in &subscriber_events {
                if day_last.get(&event.call_date) != Some(&event.call_datetime) {
                    continue;
                }
                let Some(region) = &event.region else {
                    continue;
                };
                let entry = votes
                    .entry((bucket_of(event), region.clone()))
                    .or_insert((0, event.call_date));
                entry.0 += 1;
                if event.call_date > entry.1 {
                    entry.1 = event.call_date;
                }
            }

            // Winner per bucket: highest count, then most recent day, then
            // lexicographically greatest region.
            let mut winners: BTreeMap<DateTime<Utc>, (u64, NaiveDate, String)> = BTreeMap::new();
            for ((bucket, region), (count, last_day)) in votes {
                let candidate = (count, last_day, region);
                match winners.get(&bucket) {
                    Some(current) if *current >= candidate => {}
                    _ => {
                        winners.insert(bucket, candidate);
                    }
                }
            }

            for (bucket, (_, _, home_region)) in winners {
                assignments.push(HomeLocation {
                    subscriber_id: subscriber.to_string(),
                    bucket,
                    home_region,
                });
            }
        }
        assignments
    }

    /// Count subscribers per (bucket, home region)
    pub fn unique_subscriber_home_locations(
        events: &[CallEvent],
        filter: &PeriodFilter,
        frequency: Frequency,
    ) -> Vec<HomeLocationCountRow> {
        let mut counts: BTreeMap<(DateTime<Utc>, String), u64> = BTreeMap::new();
        for home in Self::assign(events, filter, frequency) {
            *counts.entry((home.bucket, home.home_region)).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|((bucket, home_region), count)| HomeLocationCountRow {
                bucket,
                home_region,
                count,
            })
            .collect()
    }

    /// Cross-tabulate the dominant dwell region per (subscriber, bucket)
    /// against the subscriber's home region at `home_frequency`.
    ///
    /// The dominant region is the one with the largest summed midpoint
    /// dwell duration; ties fall to the lexicographically greatest region.
    pub fn home_vs_day_location(
        events: &[CallEvent],
        filter: &PeriodFilter,
        frequency: Frequency,
        home_frequency: Frequency,
    ) -> Vec<DayVsHomeRow> {
        let homes: HashMap<(String, DateTime<Utc>), String> =
            Self::assign(events, filter, home_frequency)
                .into_iter()
                .map(|h| ((h.subscriber_id, h.bucket), h.home_region))
                .collect();

        // Summed dwell duration per (subscriber, bucket, home bucket, region)
        let mut durations: BTreeMap<(String, DateTime<Utc>, DateTime<Utc>, String), f64> =
            BTreeMap::new();
        for event in events.iter().filter(|e| filter.contains(e.call_datetime)) {
            let (Some(region), Some(duration)) = (&event.region, event.midpoint_duration()) else {
                continue;
            };
            *durations
                .entry((
                    event.subscriber_id.clone(),
                    event.bucket(frequency),
                    event.bucket(home_frequency),
                    region.clone(),
                ))
                .or_default() += duration;
        }

        // Dominant region per (subscriber, bucket, home bucket)
        let mut dominant: BTreeMap<(String, DateTime<Utc>, DateTime<Utc>), (f64, String)> =
            BTreeMap::new();
        for ((subscriber, bucket, home_bucket, region), total) in durations {
            let candidate = (total, region);
            let key = (subscriber, bucket, home_bucket);
            match dominant.get(&key) {
                Some((best, best_region))
                    if (*best, best_region.as_str())
                        >= (candidate.0, candidate.1.as_str()) => {}
                _ => {
                    dominant.insert(key, candidate);
                }
            }
        }

        let mut counts: BTreeMap<(DateTime<Utc>, String, Option<String>), u64> = BTreeMap::new();
        for ((subscriber, bucket, home_bucket), (_, region)) in dominant {
            let home_region = homes.get(&(subscriber, home_bucket)).cloned();
            *counts.entry((bucket, region, home_region)).or_default() += 1;
        }

        counts
            .into_iter()
            .map(|((bucket, region, home_region), count)| DayVsHomeRow {
                bucket,
                region,
                home_region,
                count,
            })
            .collect()
    }

    /// Serialize assignments for later re-use
    pub fn to_json(assignments: &[HomeLocation]) -> Result<String, serde_json::Error> {
        serde_json::to_string(assignments)
    }

    /// Load previously materialized assignments
    pub fn from_json(json: &str) -> Result<Vec<HomeLocation>, serde_json::Error> {
        serde_json::from_str(json)
    }
}
