use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::domain::{MatchLevel, WorkflowType};
use crate::error::StudyError;
use crate::matcher::{CleanupRule, MatchRules};
use crate::store::Store;

pub const DEFAULT_FILE_TYPE: &str = ".raw";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MASSIVE_HOST: &str = "massive-ftp.ucsd.edu";
pub const DEFAULT_NMDC_API: &str = "https://api.microbiomedata.org";
pub const DEFAULT_PRIMARY_PATTERN: &str = r"^([A-Za-z]*\d+)";
pub const DEFAULT_SECONDARY_PATTERN: &str = r"(\d+)";
pub const UNKNOWN: &str = "Unknown";

/// Keys that must be present before anything else is parsed.
const REQUIRED_KEYS: &[(&str, &str)] = &[
    ("study", "name"),
    ("study", "id"),
    ("workflow", "name"),
    ("paths", "base_directory"),
    ("paths", "data_directory"),
];

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub study: StudySection,
    pub workflow: WorkflowSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub matching: MatchingSection,
    #[serde(default)]
    pub metadata: MetadataSection,
    #[serde(default)]
    pub configurations: Vec<ConfigurationEntry>,
    #[serde(default)]
    pub minio: MinioSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub nmdc: NmdcSection,
    #[serde(default)]
    pub problem_files: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StudySection {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_type: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkflowSection {
    pub name: String,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub massive_id: Option<String>,
    #[serde(default)]
    pub file_filters: Vec<String>,
    #[serde(default)]
    pub processed_data_date_tag: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PathsSection {
    pub base_directory: Utf8PathBuf,
    pub data_directory: Utf8PathBuf,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MatchingSection {
    #[serde(default)]
    pub primary_pattern: Option<String>,
    #[serde(default)]
    pub secondary_pattern: Option<String>,
    #[serde(default)]
    pub control_patterns: Vec<String>,
    #[serde(default)]
    pub calibration_patterns: Vec<String>,
    #[serde(default)]
    pub cleanup_rules: Vec<CleanupRuleEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CleanupRuleEntry {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default = "default_rule_confidence")]
    pub confidence: MatchLevel,
}

fn default_rule_confidence() -> MatchLevel {
    MatchLevel::Medium
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MetadataSection {
    #[serde(default)]
    pub instrument_used: Option<String>,
    #[serde(default)]
    pub mass_spec_configuration_name: Option<String>,
    #[serde(default)]
    pub chromat_configuration_name: Option<String>,
    #[serde(default)]
    pub processing_institution_workflow: Option<String>,
    #[serde(default)]
    pub processing_institution_generation: Option<String>,
    #[serde(default)]
    pub raw_data_location: Option<String>,
    #[serde(default)]
    pub serial_numbers_to_remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigurationEntry {
    pub name: String,
    #[serde(default)]
    pub file_filter: Vec<String>,
    #[serde(default)]
    pub instrument_used: Option<String>,
    #[serde(default)]
    pub mass_spec_configuration_name: Option<String>,
    #[serde(default)]
    pub chromat_configuration_name: Option<String>,
    #[serde(default)]
    pub metadata_overrides: BTreeMap<String, PatternOverrides>,
    #[serde(default)]
    pub corems_toml: Option<Utf8PathBuf>,
    #[serde(default)]
    pub reference_db: Option<Utf8PathBuf>,
    #[serde(default)]
    pub scan_translator: Option<Utf8PathBuf>,
    #[serde(default)]
    pub output_type: Option<String>,
    #[serde(default)]
    pub cores: Option<usize>,
}

/// Pattern -> value pairs in document order; the first pattern found in a
/// file name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternOverrides(pub Vec<(String, String)>);

impl PatternOverrides {
    pub fn resolve(&self, file_name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(pattern, _)| file_name.contains(pattern.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

impl Serialize for PatternOverrides {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (pattern, value) in &self.0 {
            map.serialize_entry(pattern, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PatternOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = PatternOverrides;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of filename pattern to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::new();
                while let Some((pattern, value)) = access.next_entry::<String, String>()? {
                    pairs.push((pattern, value));
                }
                Ok(PatternOverrides(pairs))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MinioSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DockerSection {
    #[serde(default)]
    pub raw_data_inspector_image: Option<String>,
    #[serde(default)]
    pub inspector_command: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NmdcSection {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub ftp_host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StudyInfo {
    pub name: String,
    pub id: String,
    pub description: String,
    /// Lowercased extension including the leading dot.
    pub file_type: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub name: String,
    pub workflow_type: Option<WorkflowType>,
    pub massive_id: Option<String>,
    pub file_filters: Vec<String>,
    pub batch_size: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct MetadataDefaults {
    pub instrument_used: String,
    pub mass_spec_configuration_name: String,
    pub chromat_configuration_name: String,
    pub processing_institution_workflow: String,
    pub processing_institution_generation: String,
    pub raw_data_location: RawDataLocation,
    pub serial_numbers_to_remove: BTreeSet<String>,
}

impl MetadataDefaults {
    /// Per-file metadata fields before any configuration is applied.
    pub fn base_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("instrument_used".to_string(), self.instrument_used.clone()),
            (
                "mass_spec_configuration_name".to_string(),
                self.mass_spec_configuration_name.clone(),
            ),
            (
                "chromat_configuration_name".to_string(),
                self.chromat_configuration_name.clone(),
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDataLocation {
    Massive,
    Minio,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint: Option<String>,
    pub secure: bool,
    pub region: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct InspectorSettings {
    pub image: Option<String>,
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_workers: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub study: StudyInfo,
    pub workflow: WorkflowSettings,
    pub store: Store,
    pub matching: MatchRules,
    pub metadata: MetadataDefaults,
    pub configurations: Vec<ConfigurationEntry>,
    pub object_store: ObjectStoreSettings,
    pub inspector: InspectorSettings,
    pub api_base: String,
    pub ftp_host: String,
    pub problem_files: BTreeSet<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn read_document(path: &Utf8Path) -> Result<Value, StudyError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| StudyError::ConfigRead(path.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| StudyError::Configuration(format!("{path} is not valid JSON: {err}")))
    }

    pub fn resolve(path: &Utf8Path) -> Result<ResolvedConfig, StudyError> {
        let document = Self::read_document(path)?;
        Self::resolve_document(&document)
    }

    pub fn resolve_document(document: &Value) -> Result<ResolvedConfig, StudyError> {
        check_required_keys(document)?;
        let config: Config = serde_json::from_value(document.clone())
            .map_err(|err| StudyError::Configuration(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, StudyError> {
        let file_type = normalize_extension(
            config
                .study
                .file_type
                .as_deref()
                .unwrap_or(DEFAULT_FILE_TYPE),
        );

        let workflow_type = config
            .workflow
            .workflow_type
            .as_deref()
            .map(str::parse::<WorkflowType>)
            .transpose()?;

        let batch_size = NonZeroUsize::new(config.workflow.batch_size.unwrap_or(DEFAULT_BATCH_SIZE))
            .ok_or_else(|| {
                StudyError::Configuration("workflow.batch_size must be at least 1".to_string())
            })?;

        let mut seen = BTreeSet::new();
        for entry in &config.configurations {
            if entry.name.trim().is_empty() {
                return Err(StudyError::Configuration(
                    "every configuration needs a name".to_string(),
                ));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(StudyError::Configuration(format!(
                    "duplicate configuration name: {}",
                    entry.name
                )));
            }
        }

        let matching = compile_matching(&config.matching)?;
        let metadata = resolve_metadata(&config.metadata)?;

        let store = Store::new(
            &config.paths.base_directory,
            &config.paths.data_directory,
            &config.workflow.name,
            &config.study.name,
            config.workflow.processed_data_date_tag.as_deref(),
        );

        Ok(ResolvedConfig {
            study: StudyInfo {
                name: config.study.name,
                id: config.study.id,
                description: config.study.description,
                file_type,
            },
            workflow: WorkflowSettings {
                name: config.workflow.name,
                workflow_type,
                massive_id: config
                    .workflow
                    .massive_id
                    .filter(|value| !value.trim().is_empty()),
                file_filters: config.workflow.file_filters,
                batch_size,
            },
            store,
            matching,
            metadata,
            configurations: config.configurations,
            object_store: ObjectStoreSettings {
                endpoint: config.minio.endpoint,
                secure: config.minio.secure.unwrap_or(true),
                region: config.minio.region.unwrap_or_else(|| "us-east-1".to_string()),
                bucket: config.minio.bucket.unwrap_or_else(|| "metabolomics".to_string()),
            },
            inspector: InspectorSettings {
                image: config.docker.raw_data_inspector_image,
                command: config
                    .docker
                    .inspector_command
                    .unwrap_or_else(default_inspector_command),
                timeout_secs: config.docker.timeout_secs.unwrap_or(3600),
                max_workers: config.docker.max_workers.unwrap_or(4).max(1),
            },
            api_base: config
                .nmdc
                .api_base
                .unwrap_or_else(|| DEFAULT_NMDC_API.to_string())
                .trim_end_matches('/')
                .to_string(),
            ftp_host: config
                .nmdc
                .ftp_host
                .unwrap_or_else(|| DEFAULT_MASSIVE_HOST.to_string()),
            problem_files: config.problem_files.into_iter().collect(),
        })
    }
}

fn check_required_keys(document: &Value) -> Result<(), StudyError> {
    if !document.is_object() {
        return Err(StudyError::Configuration(
            "configuration document must be a JSON object".to_string(),
        ));
    }
    let missing: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|(section, key)| {
            document
                .get(section)
                .and_then(|value| value.get(key))
                .and_then(Value::as_str)
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|(section, key)| format!("{section}.{key}"))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StudyError::Configuration(format!(
            "missing required key(s): {}",
            missing.join(", ")
        )))
    }
}

fn compile_matching(section: &MatchingSection) -> Result<MatchRules, StudyError> {
    let primary = compile(
        "matching.primary_pattern",
        section
            .primary_pattern
            .as_deref()
            .unwrap_or(DEFAULT_PRIMARY_PATTERN),
    )?;
    let secondary = compile(
        "matching.secondary_pattern",
        section
            .secondary_pattern
            .as_deref()
            .unwrap_or(DEFAULT_SECONDARY_PATTERN),
    )?;
    let cleanup_rules = section
        .cleanup_rules
        .iter()
        .map(|rule| {
            Ok(CleanupRule {
                pattern: compile("matching.cleanup_rules", &rule.pattern)?,
                replacement: rule.replacement.clone(),
                level: rule.confidence,
            })
        })
        .collect::<Result<Vec<_>, StudyError>>()?;

    Ok(MatchRules {
        primary,
        secondary,
        control_patterns: lowercase_all(&section.control_patterns),
        calibration_patterns: lowercase_all(&section.calibration_patterns),
        cleanup_rules,
    })
}

fn resolve_metadata(section: &MetadataSection) -> Result<MetadataDefaults, StudyError> {
    let raw_data_location = match section
        .raw_data_location
        .as_deref()
        .unwrap_or("massive")
        .to_lowercase()
        .as_str()
    {
        "massive" => RawDataLocation::Massive,
        "minio" => RawDataLocation::Minio,
        other => {
            return Err(StudyError::Configuration(format!(
                "unsupported metadata.raw_data_location '{other}', expected massive or minio"
            )));
        }
    };
    let or_unknown = |value: &Option<String>| value.clone().unwrap_or_else(|| UNKNOWN.to_string());
    Ok(MetadataDefaults {
        instrument_used: or_unknown(&section.instrument_used),
        mass_spec_configuration_name: or_unknown(&section.mass_spec_configuration_name),
        chromat_configuration_name: or_unknown(&section.chromat_configuration_name),
        processing_institution_workflow: section
            .processing_institution_workflow
            .clone()
            .unwrap_or_else(|| "EMSL".to_string()),
        processing_institution_generation: section
            .processing_institution_generation
            .clone()
            .unwrap_or_else(|| "EMSL".to_string()),
        raw_data_location,
        serial_numbers_to_remove: section.serial_numbers_to_remove.iter().cloned().collect(),
    })
}

fn compile(field: &str, pattern: &str) -> Result<Regex, StudyError> {
    Regex::new(pattern)
        .map_err(|err| StudyError::Configuration(format!("{field}: invalid regex '{pattern}': {err}")))
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

pub fn normalize_extension(value: &str) -> String {
    let trimmed = value.trim().to_lowercase();
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{trimmed}")
    }
}

pub fn default_inspector_command() -> Vec<String> {
    vec![
        "python".to_string(),
        "/app/raw_data_inspector.py".to_string(),
        "--json".to_string(),
    ]
}
