//! betrack - Command-line interface for the battery energy tracker
//!
//! Commands:
//! - replay: Drive a tracker from recorded NDJSON frames
//! - doctor: Check configuration, entity mapping and state files
//! - config: Print the default configuration

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use battery_energy_tracker::mapping::REQUIRED_SIGNALS;
use battery_energy_tracker::{
    BatteryTracker, Command, EntityMapper, PatternMapper, PersistedTotals, Snapshot,
    StaticSource, TrackerConfig, TrackerError, PRODUCER_NAME, TRACKER_VERSION,
};
use chrono::{DateTime, Utc};

/// betrack - Energy accounting for multi-unit battery banks
#[derive(Parser)]
#[command(name = "betrack")]
#[command(version = TRACKER_VERSION)]
#[command(about = "Track battery charge/discharge energy from raw BMS counters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded readings and commands through a tracker
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Tracker configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Load persisted totals before replaying
        #[arg(long)]
        load_state: Option<PathBuf>,

        /// Save persisted totals after replaying
        #[arg(long)]
        save_state: Option<PathBuf>,
    },

    /// Check configuration, entity mapping and state
    Doctor {
        /// Tracker configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Persisted state file to validate
        #[arg(long)]
        state: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as JSON
    Config,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one snapshot per line)
    Ndjson,
    /// JSON array of snapshots
    Json,
    /// Pretty-printed JSON array
    JsonPretty,
}

fn main() -> ExitCode {
    init_tracing();
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

/// Logs go to stderr so stdout stays machine-readable
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,battery_energy_tracker=info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init();
}

fn run(cli: Cli) -> Result<(), BetrackCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            output_format,
            config,
            load_state,
            save_state,
        } => cmd_replay(
            &input,
            &output,
            output_format,
            config.as_deref(),
            load_state.as_deref(),
            save_state.as_deref(),
        ),
        Commands::Doctor {
            config,
            state,
            json,
        } => cmd_doctor(config.as_deref(), state.as_deref(), json),
        Commands::Config => {
            println!("{}", TrackerConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig, BetrackCliError> {
    match path {
        Some(path) => Ok(TrackerConfig::from_file(path)?),
        None => Ok(TrackerConfig::default()),
    }
}

/// One line of replay input
#[derive(Debug)]
enum ReplayFrame {
    Tick {
        timestamp: DateTime<Utc>,
        readings: serde_json::Map<String, serde_json::Value>,
    },
    Command {
        timestamp: Option<DateTime<Utc>>,
        command: Command,
    },
}

fn parse_frame(line: &str, line_no: usize) -> Result<ReplayFrame, BetrackCliError> {
    let mut value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)?;
    let frame_type = value
        .remove("type")
        .and_then(|t| t.as_str().map(str::to_string))
        .ok_or_else(|| BetrackCliError::Frame(line_no, "missing \"type\"".to_string()))?;
    let timestamp = value
        .remove("timestamp")
        .map(serde_json::from_value::<DateTime<Utc>>)
        .transpose()?;

    match frame_type.as_str() {
        "tick" => {
            let timestamp = timestamp.ok_or_else(|| {
                BetrackCliError::Frame(line_no, "tick frame needs a timestamp".to_string())
            })?;
            let readings = match value.remove("readings") {
                Some(serde_json::Value::Object(readings)) => readings,
                None => serde_json::Map::new(),
                Some(_) => {
                    return Err(BetrackCliError::Frame(
                        line_no,
                        "\"readings\" must be an object".to_string(),
                    ))
                }
            };
            Ok(ReplayFrame::Tick {
                timestamp,
                readings,
            })
        }
        "command" => Ok(ReplayFrame::Command {
            timestamp,
            command: serde_json::from_value(serde_json::Value::Object(value))?,
        }),
        other => Err(BetrackCliError::Frame(
            line_no,
            format!("unknown frame type \"{other}\""),
        )),
    }
}

fn cmd_replay(
    input: &Path,
    output: &Path,
    output_format: OutputFormat,
    config: Option<&Path>,
    load_state: Option<&Path>,
    save_state: Option<&Path>,
) -> Result<(), BetrackCliError> {
    let config = load_config(config)?;
    let mapper = PatternMapper::from_config(&config);
    let mut tracker = BatteryTracker::with_config(config)?;

    if let Some(path) = load_state {
        tracker.restore(PersistedTotals::load(path)?);
    }

    let reader: Box<dyn BufRead> = if input.to_string_lossy() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(fs::File::open(input)?))
    };

    let mut source = StaticSource::new();
    let mut clock: Option<DateTime<Utc>> = None;
    let mut snapshots: Vec<Snapshot> = Vec::new();
    let mut rejected = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_frame(&line, index + 1)? {
            ReplayFrame::Tick {
                timestamp,
                readings,
            } => {
                source.update_from_json(&readings);
                clock = Some(timestamp);
                snapshots.push(tracker.tick(timestamp, &source, &mapper).snapshot);
            }
            ReplayFrame::Command { timestamp, command } => {
                let now = timestamp.or(clock).unwrap_or_else(Utc::now);
                let name = command.name();
                match tracker.execute(command, now) {
                    Ok(()) => {
                        snapshots.push(tracker.tick(now, &source, &mapper).snapshot);
                    }
                    Err(err) => {
                        rejected += 1;
                        tracing::warn!(line = index + 1, command = name, error = %err, "command rejected");
                    }
                }
            }
        }
    }

    tracing::info!(snapshots = snapshots.len(), rejected, "replay finished");

    if let Some(path) = save_state {
        tracker.persisted().save(path)?;
    }

    let output_data = format_output(&snapshots, &output_format)?;
    if output.to_string_lossy() == "-" {
        let mut stdout = io::stdout().lock();
        stdout.write_all(output_data.as_bytes())?;
        stdout.flush()?;
    } else {
        fs::write(output, output_data)?;
    }

    Ok(())
}

fn format_output(snapshots: &[Snapshot], format: &OutputFormat) -> Result<String, BetrackCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for snapshot in snapshots {
                out.push_str(&serde_json::to_string(snapshot)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string(snapshots)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(snapshots)? + "\n"),
    }
}

fn cmd_doctor(config: Option<&Path>, state: Option<&Path>, json: bool) -> Result<(), BetrackCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} {}", PRODUCER_NAME, TRACKER_VERSION),
    });

    let resolved = match config {
        Some(path) => match TrackerConfig::from_file(path) {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "{} batteries, nominal charge rate {} W",
                        config.battery_count, config.charge_rate_w
                    ),
                });
                Some(config)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                });
                None
            }
        },
        None => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "No config file given, using defaults".to_string(),
            });
            Some(TrackerConfig::default())
        }
    };

    let mut mapping = None;
    if let Some(config) = &resolved {
        let resolved_mapping = PatternMapper::from_config(config).map(config.battery_count);
        let missing = resolved_mapping.missing(config.battery_count);
        checks.push(if missing.is_empty() {
            DoctorCheck {
                name: "mapping".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "{} handles mapped, all {} required signals present",
                    resolved_mapping.len(),
                    REQUIRED_SIGNALS.len()
                ),
            }
        } else {
            DoctorCheck {
                name: "mapping".to_string(),
                status: CheckStatus::Warning,
                message: format!(
                    "Missing: {}",
                    missing
                        .iter()
                        .map(|(battery, signal)| format!("battery {battery} {signal}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }
        });
        mapping = Some(resolved_mapping);
    }

    if let Some(path) = state {
        checks.push(match PersistedTotals::load(path) {
            Ok(state) => DoctorCheck {
                name: "state".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "State valid ({} batteries, {:.2} kWh discharged, {:.2} kWh charged)",
                    state.batteries.len(),
                    state.total_discharge_counter * 0.001,
                    state.total_charge_counter * 0.001
                ),
            },
            Err(e) => DoctorCheck {
                name: "state".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            },
        });
    }

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: TRACKER_VERSION.to_string(),
        checks,
        mapping,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("betrack Doctor Report");
        println!("=====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }

        if let Some(mapping) = &report.mapping {
            println!("\nMapping:");
            for (battery, signal, handle) in mapping.iter() {
                println!("  battery {battery} {signal}: {handle}");
            }
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(BetrackCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum BetrackCliError {
    Io(io::Error),
    Json(serde_json::Error),
    Tracker(TrackerError),
    Frame(usize, String),
    DoctorFailed,
}

impl From<io::Error> for BetrackCliError {
    fn from(e: io::Error) -> Self {
        BetrackCliError::Io(e)
    }
}

impl From<serde_json::Error> for BetrackCliError {
    fn from(e: serde_json::Error) -> Self {
        BetrackCliError::Json(e)
    }
}

impl From<TrackerError> for BetrackCliError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Io(e) => BetrackCliError::Io(e),
            TrackerError::Json(e) => BetrackCliError::Json(e),
            other => BetrackCliError::Tracker(other),
        }
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<BetrackCliError> for CliError {
    fn from(e: BetrackCliError) -> Self {
        match e {
            BetrackCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            BetrackCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            BetrackCliError::Tracker(e) => CliError {
                code: if e.is_validation() {
                    "VALIDATION_ERROR".to_string()
                } else {
                    "TRACKER_ERROR".to_string()
                },
                message: e.to_string(),
                hint: Some("Run 'betrack doctor --config <file>' for details".to_string()),
            },
            BetrackCliError::Frame(line, message) => CliError {
                code: "FRAME_ERROR".to_string(),
                message: format!("line {line}: {message}"),
                hint: Some("Frames need \"type\": \"tick\" or \"command\"".to_string()),
            },
            BetrackCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mapping: Option<battery_energy_tracker::EntityMapping>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
