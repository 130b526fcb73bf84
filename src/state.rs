//! Persisted skip triggers that make the pipeline resumable.
//!
//! The whole configuration document is kept as loaded so that keys this
//! crate does not know about survive every rewrite.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{ConfigLoader, ResolvedConfig};
use crate::error::StudyError;
use crate::store;

pub const SKIP_TRIGGERS_KEY: &str = "skip_triggers";

/// Flags owned by pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFlag {
    StudyStructureCreated,
    RemoteFilesDiscovered,
    RawDataDownloaded,
    BiosampleAttributesFetched,
    BiosampleMappingCompleted,
    RawDataInspected,
    WdlsGenerated,
    DataProcessed,
    ProcessedDataUploadedToMinio,
    MetadataMappingGenerated,
    MetadataPackagesSubmitted,
}

impl StepFlag {
    pub const ALL: [StepFlag; 11] = [
        StepFlag::StudyStructureCreated,
        StepFlag::RemoteFilesDiscovered,
        StepFlag::RawDataDownloaded,
        StepFlag::BiosampleAttributesFetched,
        StepFlag::BiosampleMappingCompleted,
        StepFlag::RawDataInspected,
        StepFlag::WdlsGenerated,
        StepFlag::DataProcessed,
        StepFlag::ProcessedDataUploadedToMinio,
        StepFlag::MetadataMappingGenerated,
        StepFlag::MetadataPackagesSubmitted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepFlag::StudyStructureCreated => "study_structure_created",
            StepFlag::RemoteFilesDiscovered => "remote_files_discovered",
            StepFlag::RawDataDownloaded => "raw_data_downloaded",
            StepFlag::BiosampleAttributesFetched => "biosample_attributes_fetched",
            StepFlag::BiosampleMappingCompleted => "biosample_mapping_completed",
            StepFlag::RawDataInspected => "raw_data_inspected",
            StepFlag::WdlsGenerated => "wdls_generated",
            StepFlag::DataProcessed => "data_processed",
            StepFlag::ProcessedDataUploadedToMinio => "processed_data_uploaded_to_minio",
            StepFlag::MetadataMappingGenerated => "metadata_mapping_generated",
            StepFlag::MetadataPackagesSubmitted => "metadata_packages_submitted",
        }
    }
}

impl fmt::Display for StepFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct WorkflowState {
    path: Utf8PathBuf,
    document: Value,
    config: ResolvedConfig,
}

impl WorkflowState {
    pub fn load(path: &Utf8Path) -> Result<Self, StudyError> {
        let document = ConfigLoader::read_document(path)?;
        Self::from_document(path, document)
    }

    pub fn from_document(path: &Utf8Path, mut document: Value) -> Result<Self, StudyError> {
        let config = ConfigLoader::resolve_document(&document)?;
        let root = document.as_object_mut().ok_or_else(|| {
            StudyError::Configuration("configuration document must be a JSON object".to_string())
        })?;
        let triggers = root
            .entry(SKIP_TRIGGERS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        let triggers = triggers.as_object_mut().ok_or_else(|| {
            StudyError::Configuration(format!("{SKIP_TRIGGERS_KEY} must be an object"))
        })?;
        for flag in StepFlag::ALL {
            triggers
                .entry(flag.as_str())
                .or_insert(Value::Bool(false));
        }
        if let Some((name, _)) = triggers.iter().find(|(_, value)| !value.is_boolean()) {
            return Err(StudyError::Configuration(format!(
                "{SKIP_TRIGGERS_KEY}.{name} must be true or false"
            )));
        }
        debug!(path = %path, "loaded workflow state");
        Ok(Self {
            path: path.to_path_buf(),
            document,
            config,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Current value of a flag; unknown flags read as false.
    pub fn should_skip(&self, flag: &str) -> bool {
        self.triggers()
            .and_then(|triggers| triggers.get(flag))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_done(&self, flag: StepFlag) -> bool {
        self.should_skip(flag.as_str())
    }

    pub fn set_flag(&mut self, flag: &str, value: bool, persist: bool) -> Result<(), StudyError> {
        if let Some(triggers) = self.triggers_mut() {
            triggers.insert(flag.to_string(), Value::Bool(value));
        }
        info!(flag, value, "skip trigger updated");
        if persist { self.save() } else { Ok(()) }
    }

    pub fn mark(&mut self, flag: StepFlag) -> Result<(), StudyError> {
        self.set_flag(flag.as_str(), true, true)
    }

    pub fn reset_all(&mut self, persist: bool) -> Result<(), StudyError> {
        if let Some(triggers) = self.triggers_mut() {
            for value in triggers.values_mut() {
                *value = Value::Bool(false);
            }
        }
        info!("all skip triggers reset");
        if persist { self.save() } else { Ok(()) }
    }

    /// Flag name -> value, in document order.
    pub fn flags(&self) -> Vec<(String, bool)> {
        self.triggers()
            .map(|triggers| {
                triggers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.as_bool().unwrap_or(false)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn save(&self) -> Result<(), StudyError> {
        let content = to_json_indent4(&self.document)?;
        store::write_bytes_atomic(&self.path, &content)
    }

    fn triggers(&self) -> Option<&Map<String, Value>> {
        self.document
            .get(SKIP_TRIGGERS_KEY)
            .and_then(Value::as_object)
    }

    fn triggers_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.document
            .get_mut(SKIP_TRIGGERS_KEY)
            .and_then(Value::as_object_mut)
    }
}

pub fn to_json_indent4<T: Serialize>(value: &T) -> Result<Vec<u8>, StudyError> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| StudyError::Filesystem(err.to_string()))?;
    buffer.push(b'\n');
    Ok(buffer)
}
