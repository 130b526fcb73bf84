//! The mapping CSV is the human review checkpoint between matching and
//! processing. Reloads are validated because operators edit it by hand.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ControlKind, MappingAssignment, MatchConfidence, MatchLevel, MatchOutcome, RawFileType,
};
use crate::error::StudyError;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingRow {
    raw_file_name: String,
    raw_file_type: String,
    #[serde(default)]
    biosample_id: Option<String>,
    #[serde(default)]
    biosample_name: Option<String>,
    match_confidence: String,
}

impl From<&MappingAssignment> for MappingRow {
    fn from(assignment: &MappingAssignment) -> Self {
        Self {
            raw_file_name: assignment.raw_file_name.clone(),
            raw_file_type: assignment.raw_file_type().to_string(),
            biosample_id: assignment.outcome.biosample_id().map(str::to_string),
            biosample_name: assignment.outcome.biosample_name().map(str::to_string),
            match_confidence: assignment.confidence().to_string(),
        }
    }
}

pub fn write_mapping(path: &Utf8Path, assignments: &[MappingAssignment]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for assignment in assignments {
        writer.serialize(MappingRow::from(assignment))?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}

/// Reads a (possibly hand-edited) mapping file. Every problem in the file is
/// reported at once.
pub fn read_mapping(path: &Utf8Path) -> Result<Vec<MappingAssignment>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    let mut assignments = Vec::new();
    let mut problems = Vec::new();
    let mut names = HashSet::new();

    for (idx, row) in reader.deserialize::<MappingRow>().enumerate() {
        let line = idx + 2;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                problems.push(format!("line {line}: {err}"));
                continue;
            }
        };
        if !names.insert(row.raw_file_name.clone()) {
            problems.push(format!("line {line}: duplicate raw_file_name {}", row.raw_file_name));
            continue;
        }
        match row_to_assignment(row) {
            Ok(assignment) => assignments.push(assignment),
            Err(problem) => problems.push(format!("line {line}: {problem}")),
        }
    }

    if problems.is_empty() {
        Ok(assignments)
    } else {
        Err(StudyError::InvalidMapping {
            path: path.to_string(),
            problems,
        })
    }
}

fn row_to_assignment(row: MappingRow) -> Result<MappingAssignment, String> {
    let confidence: MatchConfidence = row.match_confidence.parse()?;
    let file_type: RawFileType = row.raw_file_type.parse()?;
    let biosample_id = row.biosample_id.filter(|value| !value.trim().is_empty());
    let biosample_name = row.biosample_name.filter(|value| !value.trim().is_empty());

    let outcome = match (confidence, biosample_id) {
        (MatchConfidence::High | MatchConfidence::Medium | MatchConfidence::Low, Some(id)) => {
            if file_type != RawFileType::Sample {
                return Err(format!(
                    "{} is a {file_type} file but carries biosample {id}",
                    row.raw_file_name
                ));
            }
            let level = match confidence {
                MatchConfidence::High => MatchLevel::High,
                MatchConfidence::Medium => MatchLevel::Medium,
                _ => MatchLevel::Low,
            };
            MatchOutcome::Matched {
                biosample_name: biosample_name.unwrap_or_else(|| id.clone()),
                biosample_id: id,
                level,
            }
        }
        (confidence, Some(id)) => {
            return Err(format!(
                "{} has biosample {id} but confidence {confidence}",
                row.raw_file_name
            ));
        }
        (confidence, None) if confidence.is_matched() => {
            return Err(format!(
                "{} is {confidence} but has no biosample_id",
                row.raw_file_name
            ));
        }
        (MatchConfidence::MultipleMatches, None) => MatchOutcome::Ambiguous { candidates: 0 },
        (_, None) => match file_type {
            RawFileType::Sample => MatchOutcome::Unmatched,
            RawFileType::Control => MatchOutcome::Control {
                kind: ControlKind::Control,
            },
            RawFileType::Calibration => MatchOutcome::Control {
                kind: ControlKind::Calibration,
            },
        },
    };

    Ok(MappingAssignment {
        raw_file_name: row.raw_file_name,
        outcome,
    })
}

/// A file cleared for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedFile {
    pub raw_file_path: Utf8PathBuf,
    pub raw_file_type: RawFileType,
    #[serde(default)]
    pub biosample_id: Option<String>,
    #[serde(default)]
    pub biosample_name: Option<String>,
    pub match_confidence: MatchConfidence,
}

impl MappedFile {
    pub fn file_name(&self) -> &str {
        self.raw_file_path.file_name().unwrap_or(self.raw_file_path.as_str())
    }
}

/// High and medium sample matches plus every control and calibration file.
pub fn mapped_files(assignments: &[MappingAssignment], raw_dir: &Utf8Path) -> Vec<MappedFile> {
    assignments
        .iter()
        .filter(|assignment| match &assignment.outcome {
            MatchOutcome::Matched { level, .. } => {
                matches!(level, MatchLevel::High | MatchLevel::Medium)
            }
            MatchOutcome::Control { .. } => true,
            _ => false,
        })
        .map(|assignment| MappedFile {
            raw_file_path: raw_dir.join(&assignment.raw_file_name),
            raw_file_type: assignment.raw_file_type(),
            biosample_id: assignment.outcome.biosample_id().map(str::to_string),
            biosample_name: assignment.outcome.biosample_name().map(str::to_string),
            match_confidence: assignment.confidence(),
        })
        .collect()
}

pub fn write_mapped_files(path: &Utf8Path, files: &[MappedFile]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for file in files {
        writer.serialize(file)?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}

pub fn read_mapped_files(path: &Utf8Path) -> Result<Vec<MappedFile>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    reader
        .deserialize()
        .map(|row| row.map_err(StudyError::from))
        .collect()
}
