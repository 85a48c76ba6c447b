//! Batch orchestration
//!
//! Runs many users' files through the pipeline on a fixed-size worker pool.
//! Workers share nothing and write disjoint per-user files; a failing or
//! panicking file is logged with its path and never stops its siblings.
//! Summary rows are collected from the workers and appended to the shared
//! summary file by the coordinating thread once the pool has drained.

use crate::config::{OutputModes, PipelineConfig};
use crate::encoder::{RowEncoder, SUMMARY_FILE_NAME};
use crate::error::ComputeError;
use crate::pipeline::UserPipeline;
use crate::types::DataClass;
use csv::StringRecord;
use rayon::prelude::*;
use serde::Serialize;
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Input file extensions picked up from a data directory
pub const INPUT_EXTENSIONS: [&str; 4] = ["csv", "json", "ndjson", "jsonl"];

/// What happened to one input file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Completed {
        user_id: String,
        class: DataClass,
        days: usize,
        written: Vec<PathBuf>,
    },
    /// Nothing to compute (unclassifiable, empty or missing input)
    Skipped { code: String, reason: String },
    Failed { code: String, message: String },
}

/// Per-file result line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub input: PathBuf,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// Result of one batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub summary_rows: usize,
    pub files: Vec<FileReport>,
}

/// Worker pool driving the per-user pipeline over many files
pub struct BatchOrchestrator {
    pipeline: UserPipeline,
    encoder: RowEncoder,
    jobs: usize,
}

impl BatchOrchestrator {
    /// Create an orchestrator; `jobs` defaults to the number of CPUs
    pub fn new(config: PipelineConfig, modes: OutputModes, jobs: Option<usize>) -> Result<Self, ComputeError> {
        if modes.is_empty() {
            return Err(ComputeError::InvalidConfig(
                "select at least one output mode (rolling, daily, summary)".to_string(),
            ));
        }
        let encoder = RowEncoder::new(&config)?;
        let pipeline = UserPipeline::new(config, modes)?;
        let jobs = jobs
            .filter(|j| *j > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        Ok(Self {
            pipeline,
            encoder,
            jobs,
        })
    }

    pub fn run_id(&self) -> &str {
        self.encoder.run_id()
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Process every input and append summary rows to `output_dir`
    pub fn run(&self, inputs: &[PathBuf], output_dir: &Path) -> Result<BatchSummary, ComputeError> {
        fs::create_dir_all(output_dir)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|i| format!("glyco-worker-{i}"))
            .build()
            .map_err(|e| ComputeError::InvalidConfig(format!("cannot start worker pool: {e}")))?;

        info!(run_id = %self.run_id(), files = inputs.len(), jobs = self.jobs, "starting batch");

        let results: Vec<(FileReport, Option<StringRecord>)> = pool.install(|| {
            inputs
                .par_iter()
                .map(|input| self.run_guarded(input, output_dir))
                .collect()
        });

        let mut summary = BatchSummary {
            run_id: self.run_id().to_string(),
            ..Default::default()
        };
        let mut rows = Vec::new();
        for (report, row) in results {
            match &report.outcome {
                FileOutcome::Completed { .. } => summary.completed += 1,
                FileOutcome::Skipped { .. } => summary.skipped += 1,
                FileOutcome::Failed { .. } => summary.failed += 1,
            }
            rows.extend(row);
            summary.files.push(report);
        }

        if self.pipeline.modes().summary && !rows.is_empty() {
            self.encoder
                .append_summary(&output_dir.join(SUMMARY_FILE_NAME), &rows)?;
        }
        summary.summary_rows = rows.len();

        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }

    /// Process a single file, turning errors and panics into an outcome
    pub fn run_guarded(&self, input: &Path, output_dir: &Path) -> (FileReport, Option<StringRecord>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_one(input, output_dir)))
            .unwrap_or_else(|payload| Err(ComputeError::WorkerPanic(panic_message(payload.as_ref()))));

        match result {
            Ok((outcome, row)) => (
                FileReport {
                    input: input.to_path_buf(),
                    outcome,
                },
                row,
            ),
            Err(e) if e.is_skip() => {
                warn!(file = %input.display(), code = e.code(), "skipped: {e}");
                let outcome = FileOutcome::Skipped {
                    code: e.code().to_string(),
                    reason: e.to_string(),
                };
                (
                    FileReport {
                        input: input.to_path_buf(),
                        outcome,
                    },
                    None,
                )
            }
            Err(e) => {
                error!(file = %input.display(), code = e.code(), "failed: {e}");
                let outcome = FileOutcome::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                (
                    FileReport {
                        input: input.to_path_buf(),
                        outcome,
                    },
                    None,
                )
            }
        }
    }

    fn run_one(&self, input: &Path, output_dir: &Path) -> Result<(FileOutcome, Option<StringRecord>), ComputeError> {
        let report = self.pipeline.process_file(input)?;
        let modes = self.pipeline.modes();

        let written = self
            .encoder
            .write_user_files(&report, output_dir, modes.rolling, modes.daily)?;
        let row = if modes.summary {
            let row = self.encoder.summary_record(&report);
            if row.is_none() {
                warn!(user = %report.user_id, "no daily snapshot; summary row omitted");
            }
            row
        } else {
            None
        };

        Ok((
            FileOutcome::Completed {
                user_id: report.user_id.clone(),
                class: report.class,
                days: report.daily.len(),
                written,
            },
            row,
        ))
    }
}

/// Input files directly under `data_dir`, sorted by name
pub fn discover_inputs(data_dir: &Path) -> Result<Vec<PathBuf>, ComputeError> {
    if !data_dir.is_dir() {
        return Err(ComputeError::MissingInput(data_dir.to_path_buf()));
    }
    let mut inputs = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| INPUT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && matches {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
