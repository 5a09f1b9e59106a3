//! Readiness CLI - Command-line interface for Readiness Core
//!
//! Commands:
//! - score: Compute daily readiness results from payload JSON (batch mode)
//! - consumption: Compute intraday training consumption
//! - baseline: Compute a baseline from sleep/HRV record files
//! - validate: Validate payload JSON without computing

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use readiness_core::pipeline::ReadinessEngine;
use readiness_core::types::{
    ConsumptionRequest, DailyPayload, HrvRecord, SleepRecord, UserProfile,
};
use readiness_core::{EngineError, ENGINE_VERSION, PRODUCER_NAME};

/// Readiness - Bayesian readiness inference engine
#[derive(Parser)]
#[command(name = "readiness")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Compute daily athletic readiness from wearable and training data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute daily readiness results from payload JSON (batch mode)
    Score {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "json")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Compute intraday training consumption from a request JSON
    Consumption {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Compute a baseline from sleep/HRV record files
    Baseline {
        /// JSON array of sleep records
        #[arg(long)]
        sleep: Option<PathBuf>,

        /// JSON array of HRV records
        #[arg(long)]
        hrv: Option<PathBuf>,

        /// Optional two-question profile JSON
        #[arg(long)]
        profile: Option<PathBuf>,

        /// User id for the computed baseline
        #[arg(long, default_value = "local")]
        user_id: String,
    },

    /// Validate payload JSON without computing
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "json")]
        input_format: InputFormat,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Single JSON document
    Json,
    /// Newline-delimited JSON (one payload per line)
    Ndjson,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one result per line)
    Ndjson,
    /// Compact JSON
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Debug)]
enum CliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<EngineError> for CliError {
    fn from(err: EngineError) -> Self {
        CliError::Engine(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Json(err)
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Io(err) => write!(f, "io error: {err}"),
            CliError::Engine(err) => write!(f, "{err}"),
            CliError::Json(err) => write!(f, "invalid JSON: {err}"),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{{\"producer\":\"{PRODUCER_NAME}\",\"error\":\"{err}\"}}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Score {
            input,
            output,
            input_format,
            output_format,
        } => cmd_score(&input, &output, input_format, output_format),
        Commands::Consumption { input, output } => cmd_consumption(&input, &output),
        Commands::Baseline {
            sleep,
            hrv,
            profile,
            user_id,
        } => cmd_baseline(sleep.as_deref(), hrv.as_deref(), profile.as_deref(), &user_id),
        Commands::Validate {
            input,
            input_format,
        } => cmd_validate(&input, input_format),
    }
}

fn read_input(path: &Path) -> Result<String, CliError> {
    if path.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn write_output(path: &Path, content: &str) -> Result<(), CliError> {
    if path.to_string_lossy() == "-" {
        let mut stdout = io::stdout().lock();
        stdout.write_all(content.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    } else {
        Ok(fs::write(path, content)?)
    }
}

fn parse_payloads(data: &str, format: InputFormat) -> Result<Vec<DailyPayload>, CliError> {
    match format {
        InputFormat::Json => Ok(vec![serde_json::from_str(data)?]),
        InputFormat::Ndjson => data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(CliError::from))
            .collect(),
    }
}

fn cmd_score(
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
) -> Result<(), CliError> {
    let data = read_input(input)?;
    let payloads = parse_payloads(&data, input_format)?;
    let engine = ReadinessEngine::new();

    let mut results = Vec::with_capacity(payloads.len());
    for payload in &payloads {
        results.push(engine.compute_readiness(payload)?);
    }

    let rendered = match output_format {
        OutputFormat::Ndjson => results
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n"),
        OutputFormat::Json => serde_json::to_string(&results)?,
        OutputFormat::JsonPretty => {
            if results.len() == 1 {
                serde_json::to_string_pretty(&results[0])?
            } else {
                serde_json::to_string_pretty(&results)?
            }
        }
    };
    write_output(output, &rendered)
}

fn cmd_consumption(input: &Path, output: &Path) -> Result<(), CliError> {
    let data = read_input(input)?;
    let request: ConsumptionRequest = serde_json::from_str(&data)?;
    let engine = ReadinessEngine::new();
    let result = engine.compute_consumption(&request)?;
    write_output(output, &serde_json::to_string_pretty(&result)?)
}

fn cmd_baseline(
    sleep: Option<&Path>,
    hrv: Option<&Path>,
    profile: Option<&Path>,
    user_id: &str,
) -> Result<(), CliError> {
    let sleep_records: Vec<SleepRecord> = match sleep {
        Some(path) => serde_json::from_str(&read_input(path)?)?,
        None => Vec::new(),
    };
    let hrv_records: Vec<HrvRecord> = match hrv {
        Some(path) => serde_json::from_str(&read_input(path)?)?,
        None => Vec::new(),
    };
    let profile: Option<UserProfile> = match profile {
        Some(path) => Some(serde_json::from_str(&read_input(path)?)?),
        None => None,
    };

    let engine = ReadinessEngine::new();
    let baseline =
        engine.get_or_compute_baseline(user_id, &sleep_records, &hrv_records, profile.as_ref());
    write_output(Path::new("-"), &serde_json::to_string_pretty(&baseline)?)
}

fn cmd_validate(input: &Path, input_format: InputFormat) -> Result<(), CliError> {
    let data = read_input(input)?;
    let payloads = parse_payloads(&data, input_format)?;

    let mut failures = 0usize;
    for (idx, payload) in payloads.iter().enumerate() {
        match payload.validate() {
            Ok(()) => {}
            Err(err) => {
                failures += 1;
                eprintln!("payload {idx}: {err}");
            }
        }
    }

    let report = serde_json::json!({
        "producer": PRODUCER_NAME,
        "version": ENGINE_VERSION,
        "payloads": payloads.len(),
        "invalid": failures,
    });
    write_output(Path::new("-"), &serde_json::to_string_pretty(&report)?)?;

    if failures > 0 {
        Err(CliError::Engine(EngineError::invalid(
            "payload",
            "validation failed",
        )))
    } else {
        Ok(())
    }
}
