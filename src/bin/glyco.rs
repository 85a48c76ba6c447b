//! Glyco CLI - Command-line interface for Synheart Glyco
//!
//! Commands:
//! - process: Run named user files from a data directory
//! - batch: Run every user file found in a data directory
//! - classify: Report the detected data class of a file without processing it

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use synheart_glyco::classifier::RecordClassifier;
use synheart_glyco::config::parse_day_start;
use synheart_glyco::schema::EventTableAdapter;
use synheart_glyco::{
    discover_inputs, BasalFillStrategy, BatchOrchestrator, BatchSummary, ComputeError, DataClass,
    FileOutcome, OutputMode, OutputModes, PipelineConfig, RoundingMode,
};
use synheart_glyco::{GLYCO_VERSION, PRODUCER_NAME};

/// Glyco - Regular-grid rolling statistics for CGM and insulin pump data
#[derive(Parser)]
#[command(name = "glyco")]
#[command(author = "Synheart AI Inc")]
#[command(version = GLYCO_VERSION)]
#[command(about = "Compute rolling glycemic and insulin statistics", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process named user files from a data directory
    Process {
        /// Directory holding the per-user event tables
        #[arg(long)]
        data_dir: PathBuf,

        /// File name(s) inside the data directory
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,

        /// Directory receiving the CSV outputs
        #[arg(short, long)]
        output_dir: PathBuf,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Process every .csv/.json/.ndjson file in a data directory
    Batch {
        /// Directory holding the per-user event tables
        #[arg(long)]
        data_dir: PathBuf,

        /// Directory receiving the CSV outputs
        #[arg(short, long)]
        output_dir: PathBuf,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Report the data class and column projection of one file
    Classify {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Output artifact(s); defaults to all three
    #[arg(long = "mode", value_enum)]
    modes: Vec<ModeArg>,

    /// Comma-separated window labels (e.g. 24hr,7day) or "continuous"
    #[arg(long, value_delimiter = ',')]
    windows: Vec<String>,

    /// Diabetes-day boundary (HH:MM, on the 5-minute grid)
    #[arg(long)]
    day_start: Option<String>,

    /// Timestamp rounding mode
    #[arg(long, value_enum)]
    rounding: Option<RoundingArg>,

    /// Basal fill strategy
    #[arg(long, value_enum)]
    basal_fill: Option<BasalFillArg>,

    /// Also compute max, percentiles and IQR
    #[arg(long)]
    percentiles: bool,

    /// Minimum fraction of non-missing points for a window value
    #[arg(long)]
    min_valid_fraction: Option<f64>,

    /// Load pipeline configuration from a JSON file (flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print the batch summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Every grid row with all window columns
    Rolling,
    /// One row per diabetes day
    Daily,
    /// Latest day appended to the shared summary file
    Summary,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoundingArg {
    /// Independent per-point rounding
    Fast,
    /// Gap-chunked, drift-free rounding
    Chunked,
}

#[derive(Clone, Copy, ValueEnum)]
enum BasalFillArg {
    /// Carry each rate until the next rate
    ForwardFill,
    /// Carry each rate for its recorded duration
    DurationExact,
}

impl From<ModeArg> for OutputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Rolling => OutputMode::Rolling,
            ModeArg::Daily => OutputMode::Daily,
            ModeArg::Summary => OutputMode::Summary,
        }
    }
}

impl From<RoundingArg> for RoundingMode {
    fn from(mode: RoundingArg) -> Self {
        match mode {
            RoundingArg::Fast => RoundingMode::Fast,
            RoundingArg::Chunked => RoundingMode::Chunked,
        }
    }
}

impl From<BasalFillArg> for BasalFillStrategy {
    fn from(strategy: BasalFillArg) -> Self {
        match strategy {
            BasalFillArg::ForwardFill => BasalFillStrategy::ForwardFill,
            BasalFillArg::DurationExact => BasalFillStrategy::DurationExact,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), GlycoCliError> {
    match cli.command {
        Commands::Process {
            data_dir,
            inputs,
            output_dir,
            pipeline,
        } => {
            let inputs: Vec<PathBuf> = inputs.iter().map(|name| data_dir.join(name)).collect();
            cmd_run(&inputs, &output_dir, &pipeline)
        }

        Commands::Batch {
            data_dir,
            output_dir,
            pipeline,
        } => {
            let inputs = discover_inputs(&data_dir)?;
            if inputs.is_empty() {
                return Err(GlycoCliError::NoInputs(data_dir));
            }
            cmd_run(&inputs, &output_dir, &pipeline)
        }

        Commands::Classify { input, json } => cmd_classify(&input, json),
    }
}

fn cmd_run(inputs: &[PathBuf], output_dir: &Path, args: &PipelineArgs) -> Result<(), GlycoCliError> {
    let config = build_config(args)?;
    let modes = if args.modes.is_empty() {
        OutputModes {
            rolling: true,
            daily: true,
            summary: true,
        }
    } else {
        let modes: Vec<OutputMode> = args.modes.iter().copied().map(OutputMode::from).collect();
        OutputModes::from_modes(&modes)
    };

    let orchestrator = BatchOrchestrator::new(config, modes, args.jobs)?;
    let summary = orchestrator.run(inputs, output_dir)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.failed > 0 {
        Err(GlycoCliError::BatchFailed {
            failed: summary.failed,
            total: summary.files.len(),
        })
    } else {
        Ok(())
    }
}

fn build_config(args: &PipelineArgs) -> Result<PipelineConfig, GlycoCliError> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    if !args.windows.is_empty() {
        config.windows = args.windows.clone();
    }
    if let Some(raw) = &args.day_start {
        config.day_start = parse_day_start(raw)?;
    }
    if let Some(rounding) = args.rounding {
        config.rounding = rounding.into();
    }
    if let Some(strategy) = args.basal_fill {
        config.basal_fill = strategy.into();
    }
    if let Some(fraction) = args.min_valid_fraction {
        config.min_valid_fraction = fraction;
    }
    if args.percentiles {
        config.percentiles = true;
    }

    config.validate()?;
    Ok(config)
}

fn print_summary(summary: &BatchSummary) {
    println!("Glyco Run {}", summary.run_id);
    println!("==========");
    println!("Producer: {} {}", PRODUCER_NAME, GLYCO_VERSION);
    println!("\nFiles:");
    for file in &summary.files {
        let line = match &file.outcome {
            FileOutcome::Completed { user_id, class, days, .. } => {
                format!("[OK]   {user_id} ({class}, {days} days)")
            }
            FileOutcome::Skipped { code, reason } => format!("[SKIP] {code}: {reason}"),
            FileOutcome::Failed { code, message } => format!("[ERR]  {code}: {message}"),
        };
        println!("  {} {}", file.input.display(), line);
    }
    println!(
        "\nCompleted: {}  Skipped: {}  Failed: {}  Summary rows: {}",
        summary.completed, summary.skipped, summary.failed, summary.summary_rows
    );
}

fn cmd_classify(input: &Path, json: bool) -> Result<(), GlycoCliError> {
    let table = EventTableAdapter::read_path(input)?;

    let (class, projection) = match RecordClassifier::inspect(&table) {
        Ok(classification) => (classification.class, classification.projection),
        Err(ComputeError::Classification(_)) => (DataClass::Na, Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let report = ClassifyReport {
        input: input.to_path_buf(),
        class,
        projection,
        records: table.events.len(),
        ignored_rows: table.ignored_rows,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Input:      {}", report.input.display());
        println!("Class:      {}", report.class);
        println!("Projection: {}", report.projection.join(", "));
        println!("Records:    {} ({} ignored rows)", report.records, report.ignored_rows);
    }
    Ok(())
}

// Error handling

#[derive(Debug)]
enum GlycoCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    NoInputs(PathBuf),
    BatchFailed { failed: usize, total: usize },
}

impl From<io::Error> for GlycoCliError {
    fn from(e: io::Error) -> Self {
        GlycoCliError::Io(e)
    }
}

impl From<ComputeError> for GlycoCliError {
    fn from(e: ComputeError) -> Self {
        GlycoCliError::Compute(e)
    }
}

impl From<serde_json::Error> for GlycoCliError {
    fn from(e: serde_json::Error) -> Self {
        GlycoCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<GlycoCliError> for CliError {
    fn from(e: GlycoCliError) -> Self {
        match e {
            GlycoCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            GlycoCliError::Compute(e) => {
                let hint = match &e {
                    ComputeError::InvalidConfig(_) => "Check --windows, --day-start and --min-valid-fraction",
                    ComputeError::ContractViolation { .. } => "Run 'glyco classify' to see the required columns",
                    ComputeError::MissingInput(_) => "Check --data-dir and --input",
                    ComputeError::Csv(_) | ComputeError::Json(_) | ComputeError::Parse(_) => {
                        "Ensure input is a per-user event table (.csv, .json or .ndjson)"
                    }
                    _ => "Re-run with -v for details",
                };
                CliError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            GlycoCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            GlycoCliError::NoInputs(dir) => CliError {
                code: "NO_INPUTS".to_string(),
                message: format!("No event tables found in {}", dir.display()),
                hint: Some("Expected .csv, .json, .ndjson or .jsonl files".to_string()),
            },
            GlycoCliError::BatchFailed { failed, total } => CliError {
                code: "BATCH_FAILED".to_string(),
                message: format!("{failed} of {total} files failed"),
                hint: Some("Review the per-file log lines for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ClassifyReport {
    input: PathBuf,
    class: DataClass,
    projection: Vec<String>,
    records: usize,
    ignored_rows: usize,
}
