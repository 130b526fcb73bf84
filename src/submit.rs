use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StudyError;
use crate::nmdc::MetadataSubmitter;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedPackage {
    pub package: Utf8PathBuf,
    pub response: String,
    pub submitted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionFailure {
    pub package: Utf8PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub submitted: Vec<SubmittedPackage>,
    pub failures: Vec<SubmissionFailure>,
}

/// Validates then submits every JSON package in `dir`. A failing package is
/// recorded and the rest still go out.
pub fn submit_packages<S: MetadataSubmitter>(
    submitter: &S,
    dir: &Utf8Path,
) -> Result<SubmissionReport, StudyError> {
    let packages = store::list_files_with_ext(dir, "json")?;
    if packages.is_empty() {
        return Err(StudyError::MissingInput(format!(
            "no submission packages in {dir}"
        )));
    }

    let mut report = SubmissionReport::default();
    for package in packages {
        match submit_one(submitter, &package) {
            Ok(response) => {
                info!(package = %package, "package submitted");
                report.submitted.push(SubmittedPackage {
                    package,
                    response,
                    submitted_at: Utc::now().to_rfc3339(),
                });
            }
            Err(err) => {
                warn!(package = %package, error = %err, "package submission failed");
                report.failures.push(SubmissionFailure {
                    package,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(report)
}

pub fn write_report(path: &Utf8Path, report: &SubmissionReport) -> Result<(), StudyError> {
    let content = serde_json::to_vec_pretty(report)
        .map_err(|err| StudyError::Filesystem(format!("serialize {path}: {err}")))?;
    store::write_bytes_atomic(path, &content)
}

/// Report of the last submission run; empty when none was recorded.
pub fn read_report(path: &Utf8Path) -> Result<SubmissionReport, StudyError> {
    if !path.exists() {
        return Ok(SubmissionReport::default());
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| StudyError::Filesystem(format!("parse {path}: {err}")))
}

fn submit_one<S: MetadataSubmitter>(submitter: &S, package: &Utf8Path) -> Result<String, StudyError> {
    let content = fs::read_to_string(package.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {package}: {err}")))?;
    let document: Value = serde_json::from_str(&content)
        .map_err(|err| StudyError::Filesystem(format!("parse {package}: {err}")))?;
    submitter.validate(&document)?;
    submitter.submit(&document)
}
