//! Indicator orchestration
//!
//! Runs the applicable indicator set for a frequency against an explicit
//! aggregation context, persists each result under its logical name, and
//! reports per-indicator outcomes. Outputs that already exist are skipped
//! before any computation happens; a failing indicator is recorded and
//! does not stop the rest of the batch.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::ActivityAggregator;
use crate::error::AggregationError;
use crate::flow::FlowAggregator;
use crate::home_location::{HomeLocation, HomeLocationResolver};
use crate::persist::ResultSink;
use crate::risk::{ImportedRiskEstimator, IncubationWindow};
use crate::types::{
    logical_name, CallEvent, DistanceMatrix, Frequency, IncidenceTable, IndicatorResult,
    PeriodFilter,
};

/// Typed run configuration, validated at construction
#[derive(Debug, Clone, Copy)]
pub struct AggregationConfig {
    /// Filter for hourly and daily indicators
    pub period: PeriodFilter,
    /// Filter for weekly and monthly indicators (whole weeks)
    pub weeks_period: PeriodFilter,
    /// Window for the imported-risk estimates
    pub incubation_window: IncubationWindow,
}

impl AggregationConfig {
    pub fn new(
        period: PeriodFilter,
        weeks_period: PeriodFilter,
        incubation_window: IncubationWindow,
    ) -> Result<Self, AggregationError> {
        let config = Self {
            period,
            weeks_period,
            incubation_window,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AggregationError> {
        if self.period.start > self.period.end {
            return Err(AggregationError::InvalidConfig(
                "period start is after period end".to_string(),
            ));
        }
        if self.weeks_period.start > self.weeks_period.end {
            return Err(AggregationError::InvalidConfig(
                "weeks period start is after weeks period end".to_string(),
            ));
        }
        if self.incubation_window.start >= self.incubation_window.end {
            return Err(AggregationError::InvalidConfig(
                "incubation window start is not before its end".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read-only inputs shared by every indicator in a run
pub struct AggregationContext {
    pub events: Vec<CallEvent>,
    /// Period-wide home region per subscriber
    pub homes: HashMap<String, String>,
    pub distances: DistanceMatrix,
    pub incidence: IncidenceTable,
}

impl AggregationContext {
    /// Build a context, resolving home locations over the configured period
    pub fn new(
        events: Vec<CallEvent>,
        distances: DistanceMatrix,
        incidence: IncidenceTable,
        config: &AggregationConfig,
    ) -> Self {
        let homes = HomeLocationResolver::assign_period(&events, &config.period);
        Self {
            events,
            homes,
            distances,
            incidence,
        }
    }

    /// Build a context from previously materialized home assignments
    /// instead of recomputing them
    pub fn with_reused_homes(
        events: Vec<CallEvent>,
        distances: DistanceMatrix,
        incidence: IncidenceTable,
        assignments: &[HomeLocation],
    ) -> Self {
        let homes = assignments
            .iter()
            .map(|h| (h.subscriber_id.clone(), h.home_region.clone()))
            .collect();
        Self {
            events,
            homes,
            distances,
            incidence,
        }
    }
}

/// Outcome of one indicator in a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Computed { rows: usize },
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IndicatorRecord {
    pub name: String,
    pub status: IndicatorStatus,
}

/// Per-run report with one record per attempted indicator
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub records: Vec<IndicatorRecord>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            records: Vec::new(),
        }
    }

    pub fn computed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, IndicatorStatus::Computed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, IndicatorStatus::Skipped))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.status, IndicatorStatus::Failed { .. }))
            .count()
    }
}

/// Orchestrator for a batch of indicator runs
pub struct IndicatorRunner<'a, S: ResultSink> {
    context: &'a AggregationContext,
    config: &'a AggregationConfig,
    sink: &'a mut S,
}

impl<'a, S: ResultSink> IndicatorRunner<'a, S> {
    pub fn new(
        context: &'a AggregationContext,
        config: &'a AggregationConfig,
        sink: &'a mut S,
    ) -> Self {
        Self {
            context,
            config,
            sink,
        }
    }

    /// Run every registered indicator for one frequency
    pub fn run_all(&mut self, filter: &PeriodFilter, frequency: Frequency) -> RunReport {
        let mut report = RunReport::new();
        self.dispatch(&mut report, filter, frequency);
        report
    }

    /// Run the full grid: daily and hourly indicators over the main
    /// period, weekly and monthly over the whole-weeks period
    pub fn run_all_frequencies(&mut self) -> RunReport {
        let mut report = RunReport::new();
        let period = self.config.period;
        let weeks = self.config.weeks_period;
        self.dispatch(&mut report, &period, Frequency::Day);
        self.dispatch(&mut report, &period, Frequency::Hour);
        self.dispatch(&mut report, &weeks, Frequency::Week);
        self.dispatch(&mut report, &weeks, Frequency::Month);
        report
    }

    /// Run the imported-risk estimates over the configured incubation
    /// window
    pub fn run_risk_estimates(&mut self) -> RunReport {
        let mut report = RunReport::new();
        let context = self.context;
        let window = self.config.incubation_window;
        let estimator = ImportedRiskEstimator::new(&context.events, &context.incidence);

        self.run_named(&mut report, "accumulated_incidence".to_string(), |name| {
            IndicatorResult::from_rows(name, &estimator.accumulated_incidence(&window))
        });
        self.run_named(
            &mut report,
            "accumulated_incidence_imported_only".to_string(),
            |name| {
                IndicatorResult::from_rows(
                    name,
                    &estimator.accumulated_incidence_imported_only(&window),
                )
            },
        );
        report
    }

    fn dispatch(&mut self, report: &mut RunReport, filter: &PeriodFilter, frequency: Frequency) {
        let context = self.context;
        let activity =
            ActivityAggregator::new(&context.events, &context.homes, &context.distances);
        let flow = FlowAggregator::new(&context.events);

        match frequency {
            Frequency::Hour => {
                self.run_indicator(report, "transactions", frequency, |name| {
                    IndicatorResult::from_rows(name, &activity.transactions(filter, frequency))
                });
                self.run_indicator(report, "unique_subscribers", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &activity.unique_subscribers(filter, frequency),
                    )
                });
            }
            Frequency::Day => {
                self.run_indicator(report, "transactions", frequency, |name| {
                    IndicatorResult::from_rows(name, &activity.transactions(filter, frequency))
                });
                self.run_indicator(report, "unique_subscribers", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &activity.unique_subscribers(filter, frequency),
                    )
                });
                self.run_indicator(
                    report,
                    "percent_of_all_subscribers_active",
                    frequency,
                    |name| {
                        IndicatorResult::from_rows(
                            name,
                            &activity.percent_of_all_subscribers_active(filter, frequency),
                        )
                    },
                );
                self.run_indicator(
                    report,
                    "origin_destination_connection_matrix",
                    frequency,
                    |name| {
                        let rows =
                            flow.origin_destination_connection_matrix(filter, frequency)?;
                        IndicatorResult::from_rows(name, &rows)
                    },
                );
                self.run_indicator(report, "mean_distance", frequency, |name| {
                    IndicatorResult::from_rows(name, &activity.mean_distance(filter, frequency))
                });
                self.run_indicator(
                    report,
                    "origin_destination_matrix_time_longest_only",
                    frequency,
                    |name| {
                        IndicatorResult::from_rows(
                            name,
                            &flow.origin_destination_matrix_time_longest_only(filter, frequency),
                        )
                    },
                );
                self.run_indicator(report, "origin_destination_matrix_time", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &flow.origin_destination_matrix_time(filter, frequency),
                    )
                });
                self.run_indicator(report, "origin_destination_matrix", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &flow.origin_destination_matrix(filter, frequency),
                    )
                });
                self.run_indicator(
                    report,
                    "origin_destination_unique_users_matrix",
                    frequency,
                    |name| {
                        IndicatorResult::from_rows(
                            name,
                            &flow.origin_destination_unique_users_matrix(filter, frequency),
                        )
                    },
                );
                self.run_indicator(report, "median_distance", frequency, |name| {
                    IndicatorResult::from_rows(name, &activity.median_distance(filter, frequency))
                });
                self.run_indicator(report, "different_areas_visited", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &activity.different_areas_visited(filter, frequency),
                    )
                });
                self.run_indicator(report, "only_in_one_region", frequency, |name| {
                    IndicatorResult::from_rows(
                        name,
                        &activity.only_in_one_region(filter, frequency),
                    )
                });
                self.run_indicator(report, "new_sims", frequency, |name| {
                    let rows = activity.new_sims(filter, frequency)?;
                    IndicatorResult::from_rows(name, &rows)
                });
            }
            Frequency::Week => {
                self.run_indicator(
                    report,
                    "unique_subscriber_home_locations",
                    frequency,
                    |name| {
                        IndicatorResult::from_rows(
                            name,
                            &HomeLocationResolver::unique_subscriber_home_locations(
                                &context.events,
                                filter,
                                frequency,
                            ),
                        )
                    },
                );
                self.run_indicator(report, "mean_distance", frequency, |name| {
                    IndicatorResult::from_rows(name, &activity.mean_distance(filter, frequency))
                });
            }
            Frequency::Month => {
                warn!(frequency = %frequency, "no indicators registered for this frequency");
            }
        }
    }

    fn run_indicator<F>(
        &mut self,
        report: &mut RunReport,
        indicator: &str,
        frequency: Frequency,
        compute: F,
    ) where
        F: FnOnce(&str) -> Result<IndicatorResult, AggregationError>,
    {
        self.run_named(report, logical_name(indicator, frequency), compute);
    }

    fn run_named<F>(&mut self, report: &mut RunReport, name: String, compute: F)
    where
        F: FnOnce(&str) -> Result<IndicatorResult, AggregationError>,
    {
        if self.sink.exists(&name) {
            info!(indicator = %name, "skipped: output already exists");
            report.records.push(IndicatorRecord {
                name,
                status: IndicatorStatus::Skipped,
            });
            return;
        }

        let outcome = compute(&name).and_then(|result| {
            let already_existed = self.sink.persist(&result)?;
            Ok((result, already_existed))
        });
        let status = match outcome {
            Ok((_, true)) => {
                info!(indicator = %name, "skipped: output already exists");
                IndicatorStatus::Skipped
            }
            Ok((result, false)) => {
                info!(indicator = %name, rows = result.len(), "computed");
                IndicatorStatus::Computed { rows: result.len() }
            }
            Err(e) => {
                warn!(indicator = %name, error = %e, "indicator failed");
                IndicatorStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        report.records.push(IndicatorRecord { name, status });
    }
}
