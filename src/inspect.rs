//! Raw-file inspection through a containerised reader.
//!
//! Results are appended to the results CSV as each file finishes, so an
//! interrupted run resumes where it stopped.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, Utc};
use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::InspectorSettings;
use crate::error::StudyError;
use crate::retry::RetryPolicy;
use crate::store;
use crate::tools::{self, SystemTools};

const CONTAINER_MOUNT: &str = "/mnt/data";

/// One row of `raw_file_inspection_results.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub file_name: String,
    pub file_path: String,
    #[serde(default)]
    pub instrument_model: Option<String>,
    #[serde(default)]
    pub instrument_name: Option<String>,
    #[serde(default)]
    pub instrument_serial_number: Option<String>,
    #[serde(default)]
    pub polarity: Option<String>,
    #[serde(default)]
    pub mz_min: Option<f64>,
    #[serde(default)]
    pub mz_max: Option<f64>,
    #[serde(default)]
    pub rt_min: Option<f64>,
    #[serde(default)]
    pub rt_max: Option<f64>,
    #[serde(default)]
    pub total_scans: Option<u64>,
    #[serde(default)]
    pub write_time: Option<String>,
}

impl InspectionRecord {
    pub fn acquired_at(&self) -> Option<NaiveDateTime> {
        self.write_time.as_deref().and_then(parse_write_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionFailure {
    pub file_name: String,
    pub file_path: String,
    pub error: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InspectionReport {
    /// Every successful record, including those from earlier runs.
    pub records: Vec<InspectionRecord>,
    pub inspected: usize,
    pub already_done: usize,
    pub failures: Vec<InspectionFailure>,
}

pub trait Inspector: Send + Sync {
    /// Fails fast when the inspection backend cannot run at all.
    fn ensure_ready(&self) -> Result<(), StudyError>;
    fn inspect(&self, file: &Utf8Path) -> Result<InspectionRecord, StudyError>;
}

pub struct DockerInspector {
    tools: SystemTools,
    image: Option<String>,
    command: Vec<String>,
    timeout: Duration,
}

impl DockerInspector {
    pub fn new(tools: SystemTools, settings: &InspectorSettings) -> Self {
        Self {
            tools,
            image: settings.image.clone(),
            command: settings.command.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    fn image(&self) -> Result<&str, StudyError> {
        self.image.as_deref().ok_or_else(|| {
            StudyError::Configuration("docker.raw_data_inspector_image is not set".to_string())
        })
    }
}

impl Inspector for DockerInspector {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        self.image()?;
        self.tools.require_docker()?;
        Ok(())
    }

    fn inspect(&self, file: &Utf8Path) -> Result<InspectionRecord, StudyError> {
        let docker = self.tools.docker_path()?;
        let file_name = file
            .file_name()
            .ok_or_else(|| StudyError::Filesystem(format!("not a file path: {file}")))?;
        let dir = file
            .parent()
            .ok_or_else(|| StudyError::Filesystem(format!("no parent directory: {file}")))?;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{dir}:{CONTAINER_MOUNT}:ro"),
            self.image()?.to_string(),
        ];
        args.extend(self.command.iter().cloned());
        args.push(format!("{CONTAINER_MOUNT}/{file_name}"));

        debug!(file = %file_name, "running inspector container");
        let output = tools::run_with_timeout(docker, &args, None, self.timeout, "raw data inspector")?;
        let mut record = parse_inspector_output(&output.stdout)?;
        // The container reports its own mount path.
        record.file_name = file_name.to_string();
        record.file_path = file.to_string();
        Ok(record)
    }
}

/// Reads the JSON object the inspector prints; log lines before it are ignored.
pub fn parse_inspector_output(stdout: &str) -> Result<InspectionRecord, StudyError> {
    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(_) => stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .and_then(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| StudyError::ToolFailed {
                tool: "raw data inspector".to_string(),
                message: "no JSON record in inspector output".to_string(),
            })?,
    };
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(StudyError::ToolFailed {
            tool: "raw data inspector".to_string(),
            message: error.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|err| StudyError::ToolFailed {
        tool: "raw data inspector".to_string(),
        message: format!("unexpected record: {err}"),
    })
}

pub fn parse_write_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Acquisition time per file name, for records that carry one.
pub fn write_times(records: &[InspectionRecord]) -> HashMap<String, NaiveDateTime> {
    records
        .iter()
        .filter_map(|record| Some((record.file_name.clone(), record.acquired_at()?)))
        .collect()
}

/// Inspects every file without a result row, `workers` at a time.
pub fn inspect_files<I: Inspector>(
    inspector: &I,
    files: &[Utf8PathBuf],
    results_path: &Utf8Path,
    errors_path: &Utf8Path,
    workers: usize,
    policy: RetryPolicy,
) -> Result<InspectionReport, StudyError> {
    let mut report = InspectionReport::default();
    if results_path.exists() {
        report.records = read_inspection_results(results_path)?;
    }
    let done: HashSet<&str> = report
        .records
        .iter()
        .map(|record| record.file_name.as_str())
        .collect();
    let pending: Vec<Utf8PathBuf> = files
        .iter()
        .filter(|file| !done.contains(file.file_name().unwrap_or(file.as_str())))
        .cloned()
        .collect();
    report.already_done = files.len() - pending.len();
    // The errors CSV only describes the latest run.
    if errors_path.exists() {
        fs::remove_file(errors_path.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("remove {errors_path}: {err}")))?;
    }
    if pending.is_empty() {
        info!(already_done = report.already_done, "all files already inspected");
        return Ok(report);
    }

    let workers = workers.clamp(1, pending.len());
    info!(
        pending = pending.len(),
        already_done = report.already_done,
        workers,
        "inspecting raw files"
    );

    let mut results = AppendCsv::open(results_path)?;
    let mut errors = AppendCsv::open(errors_path)?;
    let (job_tx, job_rx) = unbounded::<Utf8PathBuf>();
    let (result_tx, result_rx) = unbounded();
    for file in pending {
        // Receiver is alive until the scope below ends.
        let _ = job_tx.send(file);
    }
    drop(job_tx);

    let total = files.len();
    thread::scope(|scope| -> Result<(), StudyError> {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for file in job_rx.iter() {
                    let label = file.file_name().unwrap_or(file.as_str()).to_string();
                    let outcome = policy.run(&label, |_| inspector.inspect(&file));
                    if result_tx.send((file, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (file, outcome) in result_rx.iter() {
            let file_name = file.file_name().unwrap_or(file.as_str()).to_string();
            match outcome {
                Ok(record) => {
                    results.append(&record)?;
                    report.inspected += 1;
                    report.records.push(record);
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "inspection failed");
                    let failure = InspectionFailure {
                        file_name,
                        file_path: file.to_string(),
                        error: err.to_string(),
                        failed_at: Utc::now().to_rfc3339(),
                    };
                    errors.append(&failure)?;
                    report.failures.push(failure);
                }
            }
            info!(
                progress = %format!(
                    "{}/{}",
                    report.already_done + report.inspected + report.failures.len(),
                    total
                ),
                "inspection progress"
            );
        }
        Ok(())
    })?;

    info!(
        inspected = report.inspected,
        failed = report.failures.len(),
        "inspection finished"
    );
    Ok(report)
}

pub fn read_inspection_results(path: &Utf8Path) -> Result<Vec<InspectionRecord>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    reader
        .deserialize()
        .map(|row| row.map_err(StudyError::from))
        .collect()
}

/// CSV file opened for appending; the header is written only once.
struct AppendCsv {
    path: Utf8PathBuf,
    writer: Option<csv::Writer<fs::File>>,
    needs_header: bool,
}

impl AppendCsv {
    fn open(path: &Utf8Path) -> Result<Self, StudyError> {
        let needs_header = fs::metadata(path.as_std_path())
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        Ok(Self {
            path: path.to_path_buf(),
            writer: None,
            needs_header,
        })
    }

    fn append<T: Serialize>(&mut self, row: &T) -> Result<(), StudyError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                store::ensure_dir(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.as_std_path())
                .map_err(|err| StudyError::Filesystem(format!("open {}: {err}", self.path)))?;
            self.writer = Some(
                csv::WriterBuilder::new()
                    .has_headers(self.needs_header)
                    .from_writer(file),
            );
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.serialize(row)?;
            writer.flush()?;
        }
        Ok(())
    }
}
