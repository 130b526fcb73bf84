use std::collections::HashSet;
use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{WorkflowType, file_stem};
use crate::error::StudyError;
use crate::store;
use crate::tools::{self, SystemTools};

/// Executes the generated runner script.
pub trait WorkflowRunner: Send + Sync {
    fn ensure_ready(&self) -> Result<(), StudyError>;
    fn run(&self, script: &Utf8Path, working_dir: &Utf8Path) -> Result<(), StudyError>;
}

pub struct MiniwdlRunner {
    tools: SystemTools,
}

impl MiniwdlRunner {
    pub fn new(tools: SystemTools) -> Self {
        Self { tools }
    }
}

impl WorkflowRunner for MiniwdlRunner {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        self.tools.require_miniwdl()?;
        self.tools.require_docker()?;
        Ok(())
    }

    fn run(&self, script: &Utf8Path, working_dir: &Utf8Path) -> Result<(), StudyError> {
        store::ensure_dir(working_dir)?;
        tools::run_inherited(
            Path::new("bash"),
            &[script.to_string()],
            Some(working_dir.as_std_path()),
            "miniwdl",
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectedOutputs {
    pub moved: Vec<Utf8PathBuf>,
    pub skipped_foreign: usize,
    pub already_present: usize,
    /// Every output now in the processed directory.
    pub processed: Vec<Utf8PathBuf>,
}

/// Moves finished outputs from the WDL execution tree into `processed_dir`.
/// Only outputs named after one of `raw_stems` are taken.
pub fn collect_outputs(
    workflow_type: WorkflowType,
    working_dir: &Utf8Path,
    processed_dir: &Utf8Path,
    raw_stems: &HashSet<String>,
) -> Result<CollectedOutputs, StudyError> {
    let mut collected = CollectedOutputs::default();
    if !working_dir.is_dir() {
        return Ok(collected);
    }
    store::ensure_dir(processed_dir)?;

    let candidates = match workflow_type {
        WorkflowType::GcmsMetabolomics => gcms_outputs(working_dir)?,
        _ => lcms_outputs(working_dir)?,
    };
    for output in candidates {
        let Some(name) = output.file_name() else {
            continue;
        };
        let stem = match workflow_type {
            WorkflowType::GcmsMetabolomics => file_stem(name),
            _ => name.trim_end_matches(".corems"),
        };
        if !raw_stems.is_empty() && !raw_stems.contains(stem) {
            warn!(output = %name, "output does not belong to this study; skipping");
            collected.skipped_foreign += 1;
            continue;
        }
        let destination = processed_dir.join(name);
        if destination.exists() {
            collected.already_present += 1;
            continue;
        }
        move_path(&output, &destination)?;
        collected.moved.push(destination);
    }

    collected.processed = processed_outputs(workflow_type, processed_dir)?;
    info!(
        moved = collected.moved.len(),
        already_present = collected.already_present,
        processed = collected.processed.len(),
        "processed outputs collected"
    );
    Ok(collected)
}

/// Outputs already in `processed_dir`: `*.corems` directories for LCMS,
/// CSV files for GCMS.
pub fn processed_outputs(
    workflow_type: WorkflowType,
    processed_dir: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, StudyError> {
    if !processed_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut outputs = match workflow_type {
        WorkflowType::GcmsMetabolomics => store::list_files_with_ext(processed_dir, "csv")?,
        _ => subdirectories(processed_dir)?
            .into_iter()
            .filter(|path| path.as_str().ends_with(".corems"))
            .collect(),
    };
    outputs.sort();
    Ok(outputs)
}

/// `*.corems` directories that contain at least one CSV.
fn lcms_outputs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for path in subdirectories(&dir)? {
            if path.as_str().ends_with(".corems") {
                if store::list_files_with_ext(&path, "csv")?.is_empty() {
                    warn!(dir = %path, "no CSV in output directory; skipping");
                } else {
                    out.push(path);
                }
            } else {
                stack.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// `out/output_files/<n>/*.csv` under any task directory.
fn gcms_outputs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let is_output_slot = dir
            .parent()
            .filter(|parent| parent.file_name() == Some("output_files"))
            .and_then(Utf8Path::parent)
            .is_some_and(|grandparent| grandparent.file_name() == Some("out"));
        if is_output_slot {
            out.extend(store::list_files_with_ext(&dir, "csv")?);
        }
        stack.extend(subdirectories(&dir)?);
    }
    out.sort();
    Ok(out)
}

fn subdirectories(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {dir}: {err}")))?;
    Ok(entries
        .flatten()
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.is_dir())
        .collect())
}

fn move_path(from: &Utf8Path, to: &Utf8Path) -> Result<(), StudyError> {
    if fs::rename(from.as_std_path(), to.as_std_path()).is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems; copy then remove.
    let removed = if from.is_dir() {
        copy_dir(from, to)?;
        fs::remove_dir_all(from.as_std_path())
    } else {
        fs::copy(from.as_std_path(), to.as_std_path())?;
        fs::remove_file(from.as_std_path())
    };
    removed.map_err(|err| StudyError::Filesystem(format!("move {from} -> {to}: {err}")))
}

fn copy_dir(from: &Utf8Path, to: &Utf8Path) -> Result<(), StudyError> {
    store::ensure_dir(to)?;
    let entries = fs::read_dir(from.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {from}: {err}")))?;
    for entry in entries.flatten() {
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = to.join(name);
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else {
            fs::copy(path.as_std_path(), target.as_std_path())?;
        }
    }
    Ok(())
}
