//! Imported incidence-risk estimation
//!
//! Estimates the disease risk travelers carry into a region: each
//! subscriber's dwell time per region inside an incubation window is
//! weighted by that region's incidence rate, and the accumulated exposure
//! is attributed to the region of the subscriber's last stop in the
//! window.
//!
//! The break-adjusted variant discounts home exposure: the contiguous
//! trailing run of same-region stops imports nothing, and any stop at or
//! before an interrupted same-region visit is cut off. A history that
//! never leaves one region imports zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::enrichment::by_subscriber;
use crate::types::{CallEvent, IncidenceTable};

/// Normalization constant: a 21-day incubation period in seconds
pub const INCUBATION_PERIOD_SECONDS: f64 = 21.0 * 24.0 * 60.0 * 60.0;

/// Incubation window over event days, with strict bounds on both sides
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IncubationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl IncubationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    fn contains_day(&self, day: DateTime<Utc>) -> bool {
        day > self.start && day < self.end
    }
}

/// Imported incidence attributed to a destination region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedIncidenceRow {
    pub region: Option<String>,
    pub imported_incidence: f64,
}

/// One per-(day, region) stop of a subscriber inside the window
struct Stop {
    region: Option<String>,
    /// Summed midpoint dwell duration; `None` when no event of the stop
    /// had a defined duration
    total_duration: Option<f64>,
    /// Highest sequence position among the stop's events
    stop_number: u64,
}

/// Imported-risk estimator over the enriched event table
pub struct ImportedRiskEstimator<'a> {
    events: &'a [CallEvent],
    incidence: &'a IncidenceTable,
}

impl<'a> ImportedRiskEstimator<'a> {
    pub fn new(events: &'a [CallEvent], incidence: &'a IncidenceTable) -> Self {
        Self { events, incidence }
    }

    /// Per-(day, region) stops for one subscriber, ordered by sequence
    /// position. Sequence numbering runs over the subscriber's full event
    /// history; the window filter applies afterwards.
    fn stops(subscriber_events: &[&CallEvent], window: &IncubationWindow) -> Vec<Stop> {
        let mut grouped: BTreeMap<(DateTime<Utc>, Option<String>), (f64, usize, u64)> =
            BTreeMap::new();
        for (i, event) in subscriber_events.iter().enumerate() {
            if !window.contains_day(event.day) {
                continue;
            }
            let entry = grouped
                .entry((event.day, event.region.clone()))
                .or_insert((0.0, 0, 0));
            if let Some(duration) = event.midpoint_duration() {
                entry.0 += duration;
                entry.1 += 1;
            }
            entry.2 = entry.2.max(i as u64 + 1);
        }

        let mut stops: Vec<Stop> = grouped
            .into_iter()
            .map(|((_, region), (sum, matched, stop_number))| Stop {
                region,
                total_duration: (matched > 0).then_some(sum),
                stop_number,
            })
            .collect();
        stops.sort_by_key(|s| s.stop_number);
        stops
    }

    /// Incidence-weighted exposure of one stop; `None` when the region is
    /// unknown, has no incidence entry, or the stop has no duration
    fn exposure(&self, stop: &Stop) -> Option<f64> {
        let region = stop.region.as_deref()?;
        let rate = self.incidence.rate(region)?;
        let duration = stop.total_duration?;
        Some(rate * duration / INCUBATION_PERIOD_SECONDS)
    }

    /// Accumulated incidence: every in-window stop's exposure counts, and
    /// the subscriber's total is attributed to the region of their last
    /// stop. Regions that only appear as intermediate stops report zero.
    pub fn accumulated_incidence(&self, window: &IncubationWindow) -> Vec<ImportedIncidenceRow> {
        self.estimate(window, |estimator, stops| {
            stops.iter().filter_map(|s| estimator.exposure(s)).sum()
        })
    }

    /// Break-adjusted accumulated incidence: exposure from the contiguous
    /// trailing run of same-region stops is not imported, and stops at or
    /// before an interrupted visit to the final region are cut off
    /// entirely. A single uninterrupted run imports zero.
    pub fn accumulated_incidence_imported_only(
        &self,
        window: &IncubationWindow,
    ) -> Vec<ImportedIncidenceRow> {
        self.estimate(window, |estimator, stops| {
            let n = stops.len();
            let last_region = stops.last().and_then(|s| s.region.as_deref());

            // A stop matches the final region only when both are known.
            let same_region: Vec<bool> = stops
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    i + 1 != n
                        && matches!(
                            (s.region.as_deref(), last_region),
                            (Some(r), Some(l)) if r == l
                        )
                })
                .collect();

            // Trailing run membership: every stop after position i matches
            // the final region without interruption.
            let mut trailing_same = 0usize;
            let mut without_break = vec![false; n];
            for i in (0..n).rev() {
                if same_region[i] {
                    trailing_same += 1;
                }
                without_break[i] = trailing_same == n - i - 1;
            }

            // Same-region stops outside the trailing run are breaks; any
            // stop at or before the latest break is cut off.
            let with_break: Vec<bool> = (0..n)
                .map(|i| same_region[i] && !without_break[i])
                .collect();
            let mut breaks_after = vec![0usize; n];
            let mut seen = 0usize;
            for i in (0..n).rev() {
                if with_break[i] {
                    seen += 1;
                }
                breaks_after[i] = seen;
            }

            let mut counted_without_break = 0usize;
            let mut total = 0.0;
            for (i, stop) in stops.iter().enumerate() {
                if without_break[i] {
                    counted_without_break += 1;
                }
                let cutoff_clear = breaks_after[i] == 0 && counted_without_break < i + 1;
                if cutoff_clear && !without_break[i] {
                    if let Some(exposure) = estimator.exposure(stop) {
                        total += exposure;
                    }
                }
            }
            total
        })
    }

    fn estimate<F>(&self, window: &IncubationWindow, imported_total: F) -> Vec<ImportedIncidenceRow>
    where
        F: Fn(&Self, &[Stop]) -> f64,
    {
        let mut totals: BTreeMap<Option<String>, f64> = BTreeMap::new();
        for (_, subscriber_events) in by_subscriber(self.events.iter()) {
            let stops = Self::stops(&subscriber_events, window);
            let Some(last) = stops.last() else {
                continue;
            };
            // Every stop region appears in the output, imported or not.
            for stop in &stops {
                totals.entry(stop.region.clone()).or_default();
            }
            let destination = last.region.clone();
            *totals.entry(destination).or_default() += imported_total(self, &stops);
        }
        totals
            .into_iter()
            .map(|(region, imported_incidence)| ImportedIncidenceRow {
                region,
                imported_incidence,
            })
            .collect()
    }
}
