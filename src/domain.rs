use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::StudyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowType {
    #[serde(rename = "LCMS Metabolomics")]
    LcmsMetabolomics,
    #[serde(rename = "LCMS Lipidomics")]
    LcmsLipidomics,
    #[serde(rename = "GCMS Metabolomics")]
    GcmsMetabolomics,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::LcmsMetabolomics => "LCMS Metabolomics",
            WorkflowType::LcmsLipidomics => "LCMS Lipidomics",
            WorkflowType::GcmsMetabolomics => "GCMS Metabolomics",
        }
    }

    /// Name of the metaMS WDL that processes this workflow type.
    pub fn wdl_name(&self) -> &'static str {
        match self {
            WorkflowType::LcmsMetabolomics => "metaMS_lcms_metabolomics",
            WorkflowType::LcmsLipidomics => "metaMS_lcms_lipidomics",
            WorkflowType::GcmsMetabolomics => "metaMS_gcms",
        }
    }

    pub fn is_gcms(&self) -> bool {
        matches!(self, WorkflowType::GcmsMetabolomics)
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "LCMS Metabolomics" => Ok(WorkflowType::LcmsMetabolomics),
            "LCMS Lipidomics" => Ok(WorkflowType::LcmsLipidomics),
            "GCMS Metabolomics" => Ok(WorkflowType::GcmsMetabolomics),
            other => Err(StudyError::UnknownWorkflowType(other.to_string())),
        }
    }
}

/// Confidence of an accepted match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLevel {
    High,
    Medium,
    Low,
}

impl From<MatchLevel> for MatchConfidence {
    fn from(level: MatchLevel) -> Self {
        match level {
            MatchLevel::High => MatchConfidence::High,
            MatchLevel::Medium => MatchConfidence::Medium,
            MatchLevel::Low => MatchConfidence::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    High,
    Medium,
    Low,
    MultipleMatches,
    NoMatch,
}

impl MatchConfidence {
    pub const ALL: [MatchConfidence; 5] = [
        MatchConfidence::High,
        MatchConfidence::Medium,
        MatchConfidence::Low,
        MatchConfidence::MultipleMatches,
        MatchConfidence::NoMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::High => "high",
            MatchConfidence::Medium => "medium",
            MatchConfidence::Low => "low",
            MatchConfidence::MultipleMatches => "multiple_matches",
            MatchConfidence::NoMatch => "no_match",
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(
            self,
            MatchConfidence::High | MatchConfidence::Medium | MatchConfidence::Low
        )
    }
}

impl fmt::Display for MatchConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchConfidence {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MatchConfidence::ALL
            .into_iter()
            .find(|confidence| confidence.as_str() == value.trim())
            .ok_or_else(|| format!("unknown match_confidence '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFileType {
    Sample,
    Control,
    Calibration,
}

impl RawFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawFileType::Sample => "sample",
            RawFileType::Control => "control",
            RawFileType::Calibration => "calibration",
        }
    }
}

impl fmt::Display for RawFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RawFileType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "sample" => Ok(RawFileType::Sample),
            "control" | "qc" | "blank" => Ok(RawFileType::Control),
            "calibration" => Ok(RawFileType::Calibration),
            other => Err(format!("unknown raw_file_type '{other}'")),
        }
    }
}

/// Non-sample file kinds recognised by filename pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Control,
    Calibration,
}

impl From<ControlKind> for RawFileType {
    fn from(kind: ControlKind) -> Self {
        match kind {
            ControlKind::Control => RawFileType::Control,
            ControlKind::Calibration => RawFileType::Calibration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched {
        biosample_id: String,
        biosample_name: String,
        level: MatchLevel,
    },
    Ambiguous {
        candidates: usize,
    },
    Unmatched,
    Control {
        kind: ControlKind,
    },
}

impl MatchOutcome {
    pub fn confidence(&self) -> MatchConfidence {
        match self {
            MatchOutcome::Matched { level, .. } => (*level).into(),
            MatchOutcome::Ambiguous { .. } => MatchConfidence::MultipleMatches,
            MatchOutcome::Unmatched | MatchOutcome::Control { .. } => MatchConfidence::NoMatch,
        }
    }

    pub fn biosample_id(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { biosample_id, .. } => Some(biosample_id),
            _ => None,
        }
    }

    pub fn biosample_name(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { biosample_name, .. } => Some(biosample_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingAssignment {
    pub raw_file_name: String,
    pub outcome: MatchOutcome,
}

impl MappingAssignment {
    pub fn raw_file_type(&self) -> RawFileType {
        match &self.outcome {
            MatchOutcome::Control { kind } => (*kind).into(),
            _ => RawFileType::Sample,
        }
    }

    pub fn confidence(&self) -> MatchConfidence {
        self.outcome.confidence()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCatalogEntry {
    pub location_uri: String,
    pub short_name: String,
    pub file_type: String,
    #[serde(default)]
    pub local_path: Option<Utf8PathBuf>,
}

impl FileCatalogEntry {
    pub fn new(location_uri: impl Into<String>, short_name: impl Into<String>, file_type: &str) -> Self {
        Self {
            location_uri: location_uri.into(),
            short_name: short_name.into(),
            file_type: file_type.to_string(),
            local_path: None,
        }
    }

    /// Copy of this entry pointing at its downloaded location.
    pub fn downloaded_to(&self, raw_dir: &Utf8Path) -> Self {
        Self {
            local_path: Some(raw_dir.join(&self.short_name)),
            ..self.clone()
        }
    }

    pub fn stem(&self) -> &str {
        file_stem(&self.short_name)
    }
}

pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiosampleRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub samp_name: Option<String>,
    #[serde(default)]
    pub submitter_id: Option<String>,
    #[serde(default)]
    pub external_accessions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubmitEnv {
    Dev,
    Prod,
}

impl fmt::Display for SubmitEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitEnv::Dev => write!(f, "dev"),
            SubmitEnv::Prod => write!(f, "prod"),
        }
    }
}
