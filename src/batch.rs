//! Batch descriptors: the JSON inputs the metaMS WDLs are run with.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::config::ConfigurationEntry;
use crate::domain::{RawFileType, WorkflowType, file_stem};
use crate::error::StudyError;
use crate::mapping::MappedFile;
use crate::separator::{self, ConfigurationSubset, NamedFile, Separator};
use crate::state::to_json_indent4;
use crate::store::{self, Store};

const LCMS_METABOLOMICS_PREFIX: &str = "lcmsMetabolomics.runMetaMSLCMSMetabolomics";
const LCMS_LIPIDOMICS_PREFIX: &str = "lcmsLipidomics.runMetaMSLCMSLipidomics";
const GCMS_PREFIX: &str = "gcmsMetabolomics.runMetaMSGCMS";
const DEFAULT_LCMS_CORES: usize = 1;
const DEFAULT_GCMS_JOBS: usize = 5;
const DEFAULT_GCMS_OUTPUT_TYPE: &str = "csv";

#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub configuration: String,
    pub batch: usize,
    pub path: Utf8PathBuf,
    pub files: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub descriptors: Vec<Descriptor>,
    pub problem_files_excluded: usize,
    pub already_processed: usize,
    pub unassigned: Vec<String>,
}

pub struct BatchPlanner<'a> {
    pub workflow_type: WorkflowType,
    pub store: &'a Store,
    pub batch_size: NonZeroUsize,
    pub problem_files: &'a BTreeSet<String>,
    /// Acquisition times from raw-file inspection, used to bind GCMS calibrations.
    pub write_times: &'a HashMap<String, NaiveDateTime>,
}

impl BatchPlanner<'_> {
    /// Writes descriptors for every configuration, replacing earlier ones.
    pub fn generate(
        &self,
        files: &[MappedFile],
        configurations: &[ConfigurationEntry],
    ) -> Result<BatchSummary, StudyError> {
        let mut summary = BatchSummary::default();

        let mut candidates = Vec::new();
        for file in files {
            if self.problem_files.contains(file.file_name()) {
                summary.problem_files_excluded += 1;
            } else if file.raw_file_type != RawFileType::Calibration
                && self.is_processed(file.file_name())
            {
                summary.already_processed += 1;
            } else {
                candidates.push(file.clone());
            }
        }
        info!(
            files = candidates.len(),
            problem_files = summary.problem_files_excluded,
            already_processed = summary.already_processed,
            "planning batch descriptors"
        );

        let separator = Separator::new(configurations);
        let separation = separator.assign(&candidates);
        if separation.degraded {
            return Err(StudyError::MissingInput(format!(
                "no configuration matched any of {} file(s); add a matching file_filter to `configurations`",
                candidates.len()
            )));
        }
        summary.unassigned = separation.unassigned;

        clear_descriptors(&self.store.wdl_jsons_dir())?;
        for subset in &separation.subsets {
            let dir = self.store.config_wdl_dir(&subset.configuration.name);
            store::ensure_dir(&dir)?;
            let written = match self.workflow_type {
                WorkflowType::GcmsMetabolomics => self.gcms_descriptors(subset, &dir)?,
                _ => self.lcms_descriptors(subset, &dir)?,
            };
            summary.descriptors.extend(written);
        }

        info!(descriptors = summary.descriptors.len(), "batch descriptors written");
        Ok(summary)
    }

    /// LCMS output is a `{stem}.corems` directory holding at least one CSV;
    /// GCMS output is `{stem}.csv`.
    pub fn is_processed(&self, file_name: &str) -> bool {
        let stem = file_stem(file_name);
        let processed = self.store.processed_data_dir();
        match self.workflow_type {
            WorkflowType::GcmsMetabolomics => processed.join(format!("{stem}.csv")).is_file(),
            _ => store::list_files_with_ext(&processed.join(format!("{stem}.corems")), "csv")
                .map(|files| !files.is_empty())
                .unwrap_or(false),
        }
    }

    fn lcms_descriptors(
        &self,
        subset: &ConfigurationSubset<'_, MappedFile>,
        dir: &Utf8Path,
    ) -> Result<Vec<Descriptor>, StudyError> {
        let configuration = subset.configuration;
        let mut out = Vec::new();
        for (idx, chunk) in separator::batch(&subset.files, self.batch_size).iter().enumerate() {
            let batch = idx + 1;
            let paths: Vec<&str> = chunk.iter().map(|file| file.raw_file_path.as_str()).collect();
            let document = lcms_document(self.workflow_type, configuration, &paths)?;
            out.push(self.write(configuration, batch, &document, chunk.len(), dir)?);
        }
        Ok(out)
    }

    fn gcms_descriptors(
        &self,
        subset: &ConfigurationSubset<'_, MappedFile>,
        dir: &Utf8Path,
    ) -> Result<Vec<Descriptor>, StudyError> {
        let configuration = subset.configuration;
        let (calibrations, samples): (Vec<&MappedFile>, Vec<&MappedFile>) = subset
            .files
            .iter()
            .partition(|file| file.raw_file_type == RawFileType::Calibration);
        if samples.is_empty() {
            warn!(configuration = %configuration.name, "no sample files; no descriptors written");
            return Ok(Vec::new());
        }
        if calibrations.is_empty() {
            return Err(StudyError::MissingInput(format!(
                "configuration {} has no calibration files; GCMS batches need at least one",
                configuration.name
            )));
        }

        let bindings = bind_calibrations(&samples, &calibrations, self.write_times);
        let mut out = Vec::new();
        let mut batch = 0;
        for (calibration, bound) in bindings {
            for chunk in separator::batch(&bound, self.batch_size) {
                batch += 1;
                let paths: Vec<&str> = chunk.iter().map(|file| file.raw_file_path.as_str()).collect();
                let document =
                    gcms_document(configuration, &paths, calibration.raw_file_path.as_str(), batch)?;
                out.push(self.write(configuration, batch, &document, chunk.len(), dir)?);
            }
        }
        Ok(out)
    }

    fn write(
        &self,
        configuration: &ConfigurationEntry,
        batch: usize,
        document: &Value,
        files: usize,
        dir: &Utf8Path,
    ) -> Result<Descriptor, StudyError> {
        let path = dir.join(descriptor_file_name(self.workflow_type, &configuration.name, batch));
        store::write_bytes_atomic(&path, &to_json_indent4(document)?)?;
        Ok(Descriptor {
            configuration: configuration.name.clone(),
            batch,
            path,
            files,
        })
    }
}

/// Removes every descriptor below `wdl_jsons`, whichever configuration wrote it.
fn clear_descriptors(wdl_jsons: &Utf8Path) -> Result<(), StudyError> {
    if wdl_jsons.as_std_path().exists() {
        fs::remove_dir_all(wdl_jsons.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("remove {wdl_jsons}: {err}")))?;
    }
    store::ensure_dir(wdl_jsons)
}

pub fn descriptor_file_name(workflow_type: WorkflowType, configuration: &str, batch: usize) -> String {
    let stem = match workflow_type {
        WorkflowType::LcmsMetabolomics => "metaMS_lcms_metabolomics",
        WorkflowType::LcmsLipidomics => "metaMS_lcms_lipidomics",
        WorkflowType::GcmsMetabolomics => "metaMS_gcms_metabolomics",
    };
    format!("run_{stem}_{configuration}_batch{batch}.json")
}

fn required<'c>(
    value: &'c Option<Utf8PathBuf>,
    field: &str,
    configuration: &ConfigurationEntry,
) -> Result<&'c str, StudyError> {
    value.as_deref().map(Utf8Path::as_str).ok_or_else(|| {
        StudyError::Configuration(format!(
            "configuration {} is missing {field}",
            configuration.name
        ))
    })
}

pub fn lcms_document(
    workflow_type: WorkflowType,
    configuration: &ConfigurationEntry,
    file_paths: &[&str],
) -> Result<Value, StudyError> {
    let corems_toml = required(&configuration.corems_toml, "corems_toml", configuration)?;
    let reference_db = required(&configuration.reference_db, "reference_db", configuration)?;
    let scan_translator = required(&configuration.scan_translator, "scan_translator", configuration)?;
    let cores = configuration.cores.unwrap_or(DEFAULT_LCMS_CORES);

    let (prefix, db_key) = match workflow_type {
        WorkflowType::LcmsLipidomics => (LCMS_LIPIDOMICS_PREFIX, "db_location"),
        _ => (LCMS_METABOLOMICS_PREFIX, "msp_file_path"),
    };
    let mut document = Map::new();
    document.insert(format!("{prefix}.file_paths"), json!(file_paths));
    document.insert(format!("{prefix}.output_directory"), json!("output"));
    document.insert(format!("{prefix}.corems_toml_path"), json!(corems_toml));
    document.insert(format!("{prefix}.{db_key}"), json!(reference_db));
    document.insert(format!("{prefix}.scan_translator_path"), json!(scan_translator));
    document.insert(format!("{prefix}.cores"), json!(cores));
    Ok(Value::Object(document))
}

pub fn gcms_document(
    configuration: &ConfigurationEntry,
    file_paths: &[&str],
    calibration: &str,
    batch: usize,
) -> Result<Value, StudyError> {
    let corems_toml = required(&configuration.corems_toml, "corems_toml", configuration)?;
    let output_type = configuration
        .output_type
        .as_deref()
        .unwrap_or(DEFAULT_GCMS_OUTPUT_TYPE);
    let jobs = configuration.cores.unwrap_or(DEFAULT_GCMS_JOBS);

    let mut document = Map::new();
    document.insert(format!("{GCMS_PREFIX}.file_paths"), json!(file_paths));
    document.insert(format!("{GCMS_PREFIX}.calibration_file_path"), json!(calibration));
    document.insert(
        format!("{GCMS_PREFIX}.output_directory"),
        json!(format!("output_batch_{batch}")),
    );
    document.insert(format!("{GCMS_PREFIX}.output_type"), json!(output_type));
    document.insert(format!("{GCMS_PREFIX}.corems_toml_path"), json!(corems_toml));
    document.insert(format!("{GCMS_PREFIX}.jobs_count"), json!(jobs));
    document.insert(
        format!("{GCMS_PREFIX}.output_filename"),
        json!(format!("{}_batch{batch}", configuration.name)),
    );
    Ok(Value::Object(document))
}

/// Groups samples under the latest calibration acquired at or before them.
/// Samples older than every calibration, or without a known acquisition
/// time, fall back to the earliest calibration.
pub fn bind_calibrations<'f, T: NamedFile>(
    samples: &[&'f T],
    calibrations: &[&'f T],
    write_times: &HashMap<String, NaiveDateTime>,
) -> Vec<(&'f T, Vec<&'f T>)> {
    let mut timed: Vec<(Option<NaiveDateTime>, &T)> = calibrations
        .iter()
        .map(|file| (write_times.get(file.file_name()).copied(), *file))
        .collect();
    // Untimed calibrations sort first (`None < Some`), after which ties keep input order.
    timed.sort_by_key(|(time, _)| *time);
    let Some(&(_, earliest)) = timed.first() else {
        return Vec::new();
    };

    let mut groups: Vec<(&T, Vec<&T>)> = Vec::new();
    for sample in samples {
        let sample_time = write_times.get(sample.file_name()).copied();
        let calibration = sample_time
            .and_then(|at| {
                timed
                    .iter()
                    .rev()
                    .find(|(time, _)| time.is_some_and(|time| time <= at))
                    .map(|(_, file)| *file)
            })
            .unwrap_or_else(|| {
                warn!(
                    sample = %sample.file_name(),
                    calibration = %earliest.file_name(),
                    "no calibration acquired before sample; using the earliest calibration"
                );
                earliest
            });
        match groups
            .iter_mut()
            .find(|(bound, _)| bound.file_name() == calibration.file_name())
        {
            Some((_, members)) => members.push(*sample),
            None => groups.push((calibration, vec![*sample])),
        }
    }
    groups
}

/// Checks every descriptor under `wdl_jsons_dir`. Every missing path and
/// unreadable descriptor is reported in one error.
pub fn validate_descriptors(wdl_jsons_dir: &Utf8Path) -> Result<usize, StudyError> {
    let descriptors = descriptor_files(wdl_jsons_dir)?;
    let mut missing = BTreeSet::new();
    let mut corrupt = Vec::new();

    for path in &descriptors {
        let parsed = fs::read_to_string(path.as_std_path())
            .map_err(|err| err.to_string())
            .and_then(|content| {
                serde_json::from_str::<Map<String, Value>>(&content).map_err(|err| err.to_string())
            });
        let document = match parsed {
            Ok(document) => document,
            Err(err) => {
                corrupt.push(format!("{path} (unreadable: {err})"));
                continue;
            }
        };
        for (key, value) in &document {
            if key.ends_with(".file_paths") {
                for file in value.as_array().into_iter().flatten().filter_map(Value::as_str) {
                    if !Utf8Path::new(file).exists() {
                        missing.insert(file.to_string());
                    }
                }
            } else if (key.ends_with("_path") || key.ends_with("db_location"))
                && let Some(file) = value.as_str()
                && !Utf8Path::new(file).exists()
            {
                missing.insert(file.to_string());
            }
        }
    }

    if missing.is_empty() && corrupt.is_empty() {
        info!(descriptors = descriptors.len(), "batch descriptors validated");
        return Ok(descriptors.len());
    }
    let mut problems = corrupt;
    problems.extend(missing);
    Err(StudyError::MissingReferences { missing: problems })
}

/// Descriptor JSON files, one directory level per configuration.
pub fn descriptor_files(wdl_jsons_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let mut files = store::list_files_with_ext(wdl_jsons_dir, "json")?;
    if !wdl_jsons_dir.is_dir() {
        return Ok(files);
    }
    let entries = fs::read_dir(wdl_jsons_dir.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {wdl_jsons_dir}: {err}")))?;
    let mut dirs: Vec<Utf8PathBuf> = entries
        .flatten()
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    for dir in dirs {
        files.extend(store::list_files_with_ext(&dir, "json")?);
    }
    Ok(files)
}

/// Descriptors already on disk, as `generate` reported them when it wrote them.
pub fn existing_descriptors(wdl_jsons_dir: &Utf8Path) -> Result<Vec<Descriptor>, StudyError> {
    let mut out = Vec::new();
    for path in descriptor_files(wdl_jsons_dir)? {
        let configuration = path
            .parent()
            .filter(|parent| *parent != wdl_jsons_dir)
            .and_then(Utf8Path::file_name)
            .unwrap_or_default()
            .to_string();
        let batch = path
            .file_stem()
            .and_then(|stem| stem.rsplit_once("_batch"))
            .and_then(|(_, number)| number.parse().ok())
            .unwrap_or(0);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("read {path}: {err}")))?;
        let document: Map<String, Value> = serde_json::from_str(&content)
            .map_err(|err| StudyError::Filesystem(format!("parse {path}: {err}")))?;
        let files = document
            .iter()
            .find(|(key, _)| key.ends_with(".file_paths"))
            .and_then(|(_, value)| value.as_array())
            .map_or(0, Vec::len);
        out.push(Descriptor {
            configuration,
            batch,
            path,
            files,
        });
    }
    Ok(out)
}

/// Writes the shell script that runs every descriptor through miniwdl.
pub fn write_runner_script(
    path: &Utf8Path,
    wdl_jsons_dir: &Utf8Path,
    workflow_type: WorkflowType,
    study_name: &str,
    study_id: &str,
) -> Result<(), StudyError> {
    let wdl = workflow_type.wdl_name();
    let script = format!(
        r#"#!/usr/bin/env bash
# Runs every batch descriptor of study {study_name} ({study_id}) through miniwdl.
# Run from a directory that contains wdl/{wdl}.wdl.

BASE_DIR="{wdl_jsons_dir}"
WDL_FILE="${{WDL_FILE:-wdl/{wdl}.wdl}}"

if [ ! -f "$WDL_FILE" ]; then
    echo "ERROR: WDL file not found: $WDL_FILE" >&2
    exit 1
fi

NUM_BATCHES=$(find "$BASE_DIR" -type f -name '*.json' | wc -l)
echo "Found $NUM_BATCHES batch descriptors for {study_name}"

SUCCESS_COUNT=0
FAILED_COUNT=0
for JSON_FILE in $(find "$BASE_DIR" -type f -name '*.json' | sort); do
    echo "Processing batch: $(basename "$JSON_FILE")"
    if miniwdl run "$WDL_FILE" -i "$JSON_FILE" --verbose --no-cache --copy-input-files; then
        SUCCESS_COUNT=$((SUCCESS_COUNT + 1))
    else
        echo "FAILED: $JSON_FILE" >&2
        FAILED_COUNT=$((FAILED_COUNT + 1))
    fi
done

echo "Total: $NUM_BATCHES  succeeded: $SUCCESS_COUNT  failed: $FAILED_COUNT"
[ "$FAILED_COUNT" -eq 0 ]
"#
    );
    store::write_bytes_atomic(path, script.as_bytes())?;
    make_executable(path)?;
    info!(path = %path, "runner script written");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Utf8Path) -> Result<(), StudyError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(0o755))
        .map_err(|err| StudyError::Filesystem(format!("chmod {path}: {err}")))
}

#[cfg(not(unix))]
fn make_executable(_path: &Utf8Path) -> Result<(), StudyError> {
    Ok(())
}
