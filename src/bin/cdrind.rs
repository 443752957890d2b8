//! cdrind - Command-line interface for the CDR indicator engine
//!
//! Commands:
//! - run: Enrich call records and compute all registered indicators
//! - validate: Validate raw call record input

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cdr_indicators::risk::IncubationWindow;
use cdr_indicators::runner::IndicatorStatus;
use cdr_indicators::schema::{
    self, CellMapping, DistanceRecord, IncidenceRecord, RawCallRecord, RecordLoader,
};
use cdr_indicators::{
    AggregationConfig, AggregationContext, AggregationError, CellRegionMap, EventEnrichment,
    HomeLocationResolver, IndicatorRunner, NdjsonDirSink, PeriodFilter, ENGINE_VERSION,
};

/// cdrind - compute mobility indicators from call detail records
#[derive(Parser)]
#[command(name = "cdrind")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Compute mobility indicators from CDR data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich call records and run all registered indicators
    Run {
        /// Call record input path (use - for stdin)
        #[arg(short, long)]
        events: PathBuf,

        /// Cell→region mapping path
        #[arg(long)]
        cells: PathBuf,

        /// Directed distance table path
        #[arg(long)]
        distances: Option<PathBuf>,

        /// Region incidence table path
        #[arg(long)]
        incidence: Option<PathBuf>,

        /// Output directory for NDJSON result tables
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Period start date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        start_date: String,

        /// Period end date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        end_date: String,

        /// Whole-weeks period start date (defaults to the period start)
        #[arg(long)]
        weeks_start_date: Option<String>,

        /// Whole-weeks period end date (defaults to the period end)
        #[arg(long)]
        weeks_end_date: Option<String>,

        /// Incubation window start date for risk estimates
        #[arg(long)]
        incubation_start: Option<String>,

        /// Incubation window end date for risk estimates
        #[arg(long)]
        incubation_end: Option<String>,

        /// Also compute imported-risk estimates (requires an incidence
        /// table)
        #[arg(long)]
        with_risk: bool,

        /// Re-use home locations from a previous run instead of
        /// recomputing them
        #[arg(long)]
        reuse_home_locations: Option<PathBuf>,

        /// Save resolved home locations for later re-use
        #[arg(long)]
        save_home_locations: Option<PathBuf>,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate raw call record input
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CdrindError> {
    match cli.command {
        Commands::Run {
            events,
            cells,
            distances,
            incidence,
            output_dir,
            start_date,
            end_date,
            weeks_start_date,
            weeks_end_date,
            incubation_start,
            incubation_end,
            with_risk,
            reuse_home_locations,
            save_home_locations,
            input_format,
            json,
        } => cmd_run(RunArgs {
            events,
            cells,
            distances,
            incidence,
            output_dir,
            start_date,
            end_date,
            weeks_start_date,
            weeks_end_date,
            incubation_start,
            incubation_end,
            with_risk,
            reuse_home_locations,
            save_home_locations,
            input_format,
            json,
        }),
        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),
    }
}

struct RunArgs {
    events: PathBuf,
    cells: PathBuf,
    distances: Option<PathBuf>,
    incidence: Option<PathBuf>,
    output_dir: PathBuf,
    start_date: String,
    end_date: String,
    weeks_start_date: Option<String>,
    weeks_end_date: Option<String>,
    incubation_start: Option<String>,
    incubation_end: Option<String>,
    with_risk: bool,
    reuse_home_locations: Option<PathBuf>,
    save_home_locations: Option<PathBuf>,
    input_format: InputFormat,
    json: bool,
}

fn cmd_run(args: RunArgs) -> Result<(), CdrindError> {
    let records: Vec<RawCallRecord> = load_records(&args.events, args.input_format)?;
    if records.is_empty() {
        return Err(CdrindError::NoRecords);
    }

    let mappings: Vec<CellMapping> = load_records(&args.cells, args.input_format)?;
    let cell_map = CellRegionMap::from_mappings(&mappings);

    let distance_records: Vec<DistanceRecord> = match &args.distances {
        Some(path) => load_records(path, args.input_format)?,
        None => Vec::new(),
    };
    let distances = schema::distance_matrix(&distance_records);

    let incidence_records: Vec<IncidenceRecord> = match &args.incidence {
        Some(path) => load_records(path, args.input_format)?,
        None => Vec::new(),
    };
    let incidence = schema::incidence_table(&incidence_records);

    let period = PeriodFilter::new(
        parse_day_start(&args.start_date)?,
        parse_day_end(&args.end_date)?,
    );
    let weeks_period = PeriodFilter::new(
        match &args.weeks_start_date {
            Some(date) => parse_day_start(date)?,
            None => period.start,
        },
        match &args.weeks_end_date {
            Some(date) => parse_day_end(date)?,
            None => period.end,
        },
    );
    let incubation_window = IncubationWindow::new(
        match &args.incubation_start {
            Some(date) => parse_day_start(date)?,
            None => period.start,
        },
        match &args.incubation_end {
            Some(date) => parse_day_start(date)?,
            None => period.end,
        },
    );
    let config = AggregationConfig::new(period, weeks_period, incubation_window)?;

    let events = EventEnrichment::enrich(records, &cell_map);

    let context = match &args.reuse_home_locations {
        Some(path) => {
            let stored = fs::read_to_string(path)?;
            let assignments = HomeLocationResolver::from_json(&stored)
                .map_err(|e| CdrindError::ParseError(e.to_string()))?;
            AggregationContext::with_reused_homes(events, distances, incidence, &assignments)
        }
        None => AggregationContext::new(events, distances, incidence, &config),
    };

    if let Some(path) = &args.save_home_locations {
        let assignments: Vec<_> = context
            .homes
            .iter()
            .map(|(subscriber_id, home_region)| cdr_indicators::HomeLocation {
                subscriber_id: subscriber_id.clone(),
                bucket: config.period.start,
                home_region: home_region.clone(),
            })
            .collect();
        let json = HomeLocationResolver::to_json(&assignments)
            .map_err(|e| CdrindError::ParseError(e.to_string()))?;
        fs::write(path, json)?;
    }

    let mut sink = NdjsonDirSink::new(&args.output_dir);
    let mut runner = IndicatorRunner::new(&context, &config, &mut sink);
    let mut report = runner.run_all_frequencies();
    if args.with_risk {
        let risk_report = runner.run_risk_estimates();
        report.records.extend(risk_report.records);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Indicator Run Report");
        println!("====================");
        println!("Run id:   {}", report.run_id);
        println!("Computed: {}", report.computed());
        println!("Skipped:  {}", report.skipped());
        println!("Failed:   {}", report.failed());
        println!();
        for record in &report.records {
            let status = match &record.status {
                IndicatorStatus::Computed { rows } => format!("computed ({} rows)", rows),
                IndicatorStatus::Skipped => "skipped".to_string(),
                IndicatorStatus::Failed { reason } => format!("failed: {}", reason),
            };
            println!("  {:<55} {}", record.name, status);
        }
    }

    if report.failed() > 0 {
        Err(CdrindError::IndicatorsFailed(report.failed()))
    } else {
        Ok(())
    }
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), CdrindError> {
    let records: Vec<RawCallRecord> = load_records(input, input_format)?;
    let invalid = schema::validate_records(&records);

    let report = ValidationReport {
        total_records: records.len(),
        valid_records: records.len() - invalid.len(),
        invalid_records: invalid.len(),
        errors: invalid,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total records:   {}", report.total_records);
        println!("Valid records:   {}", report.valid_records);
        println!("Invalid records: {}", report.invalid_records);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - Record {} (subscriber {}): {}",
                    err.index, err.subscriber_id, err.error
                );
            }
        }
    }

    if report.invalid_records > 0 {
        Err(CdrindError::ValidationFailed(report.invalid_records))
    } else {
        Ok(())
    }
}

// Helper functions

fn load_records<T: serde::de::DeserializeOwned>(
    path: &Path,
    format: InputFormat,
) -> Result<Vec<T>, CdrindError> {
    let data = if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(path)?
    };

    let records = match format {
        InputFormat::Ndjson => RecordLoader::parse_ndjson(&data)?,
        InputFormat::Json => RecordLoader::parse_array(&data)?,
    };
    Ok(records)
}

fn parse_day_start(date: &str) -> Result<chrono::DateTime<chrono::Utc>, CdrindError> {
    let day = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| CdrindError::ParseError(format!("invalid date {}: {}", date, e)))?;
    Ok(day.and_time(chrono::NaiveTime::MIN).and_utc())
}

fn parse_day_end(date: &str) -> Result<chrono::DateTime<chrono::Utc>, CdrindError> {
    Ok(parse_day_start(date)? + chrono::Duration::seconds(86_399))
}

// Error types

#[derive(Debug)]
enum CdrindError {
    Io(io::Error),
    Aggregation(AggregationError),
    Json(serde_json::Error),
    ParseError(String),
    NoRecords,
    ValidationFailed(usize),
    IndicatorsFailed(usize),
}

impl From<io::Error> for CdrindError {
    fn from(e: io::Error) -> Self {
        CdrindError::Io(e)
    }
}

impl From<AggregationError> for CdrindError {
    fn from(e: AggregationError) -> Self {
        CdrindError::Aggregation(e)
    }
}

impl From<serde_json::Error> for CdrindError {
    fn from(e: serde_json::Error) -> Self {
        CdrindError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<CdrindError> for CliError {
    fn from(e: CdrindError) -> Self {
        match e {
            CdrindError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            CdrindError::Aggregation(e) => CliError {
                code: "AGGREGATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check configuration dates and input tables".to_string()),
            },
            CdrindError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            CdrindError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Check input format".to_string()),
            },
            CdrindError::NoRecords => CliError {
                code: "NO_RECORDS".to_string(),
                message: "No call records found in input".to_string(),
                hint: Some("Ensure the events file is not empty".to_string()),
            },
            CdrindError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            CdrindError::IndicatorsFailed(count) => CliError {
                code: "INDICATORS_FAILED".to_string(),
                message: format!("{} indicators failed", count),
                hint: Some("Review the run report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_records: usize,
    valid_records: usize,
    invalid_records: usize,
    errors: Vec<schema::InvalidRecord>,
}
