use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ConfigurationEntry, MetadataDefaults};

pub const FALLBACK_CONFIGURATION: &str = "all_data";

/// Anything the separator can route by file name.
pub trait NamedFile {
    fn file_name(&self) -> &str;
}

impl NamedFile for crate::domain::FileCatalogEntry {
    fn file_name(&self) -> &str {
        &self.short_name
    }
}

impl NamedFile for String {
    fn file_name(&self) -> &str {
        self
    }
}

impl NamedFile for crate::mapping::MappedFile {
    fn file_name(&self) -> &str {
        crate::mapping::MappedFile::file_name(self)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigurationSubset<'c, T> {
    pub configuration: &'c ConfigurationEntry,
    pub files: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct Separation<'c, T> {
    pub subsets: Vec<ConfigurationSubset<'c, T>>,
    /// Files no configuration accepted.
    pub unassigned: Vec<String>,
    /// Set when nothing matched and the catch-all configuration was used.
    pub degraded: bool,
}

/// Routes files into processing configurations.
pub struct Separator<'c> {
    configurations: &'c [ConfigurationEntry],
    fallback: ConfigurationEntry,
}

impl<'c> Separator<'c> {
    pub fn new(configurations: &'c [ConfigurationEntry]) -> Self {
        Self {
            configurations,
            fallback: fallback_configuration(),
        }
    }

    /// Files whose name contains every filter keyword, per configuration.
    /// Configurations overlap freely; a configuration matching nothing is
    /// skipped, and if none match at all the catch-all takes every file.
    pub fn assign<'s, T: NamedFile + Clone>(&'s self, files: &[T]) -> Separation<'s, T>
    where
        'c: 's,
    {
        let mut subsets = Vec::new();
        let mut assigned = HashSet::new();

        for configuration in self.configurations {
            let keywords = lowercase_keywords(&configuration.file_filter);
            let matching: Vec<T> = files
                .iter()
                .filter(|file| matches_all(file.file_name(), &keywords))
                .cloned()
                .collect();
            if matching.is_empty() {
                warn!(
                    configuration = %configuration.name,
                    filter = ?configuration.file_filter,
                    "configuration matched no files; skipping"
                );
                continue;
            }
            info!(
                configuration = %configuration.name,
                files = matching.len(),
                "configuration assigned"
            );
            for file in &matching {
                assigned.insert(file.file_name().to_string());
            }
            subsets.push(ConfigurationSubset {
                configuration,
                files: matching,
            });
        }

        if subsets.is_empty() && !files.is_empty() {
            warn!(
                files = files.len(),
                "no configuration matched any file; using the {FALLBACK_CONFIGURATION} catch-all with default metadata"
            );
            return Separation {
                subsets: vec![ConfigurationSubset {
                    configuration: &self.fallback,
                    files: files.to_vec(),
                }],
                unassigned: Vec::new(),
                degraded: true,
            };
        }

        let unassigned: Vec<String> = files
            .iter()
            .map(|file| file.file_name().to_string())
            .filter(|name| !assigned.contains(name))
            .collect();
        if !unassigned.is_empty() {
            warn!(
                count = unassigned.len(),
                files = ?unassigned,
                "files matched no configuration and are dropped"
            );
        }

        Separation {
            subsets,
            unassigned,
            degraded: false,
        }
    }
}

pub fn fallback_configuration() -> ConfigurationEntry {
    ConfigurationEntry {
        name: FALLBACK_CONFIGURATION.to_string(),
        file_filter: Vec::new(),
        instrument_used: None,
        mass_spec_configuration_name: None,
        chromat_configuration_name: None,
        metadata_overrides: BTreeMap::new(),
        corems_toml: None,
        reference_db: None,
        scan_translator: None,
        output_type: None,
        cores: None,
    }
}

fn lowercase_keywords(filter: &[String]) -> Vec<String> {
    filter
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect()
}

fn matches_all(file_name: &str, keywords: &[String]) -> bool {
    let name = file_name.to_lowercase();
    keywords.iter().all(|keyword| name.contains(keyword))
}

/// Metadata attached to one file of one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub configuration: String,
    pub fields: BTreeMap<String, String>,
}

/// Defaults, then configuration values, then the first matching pattern
/// override per field.
pub fn apply_overrides<T: NamedFile>(
    files: &[T],
    configuration: &ConfigurationEntry,
    defaults: &MetadataDefaults,
) -> Vec<FileMetadata> {
    let mut base = defaults.base_fields();
    let configured = [
        ("instrument_used", &configuration.instrument_used),
        (
            "mass_spec_configuration_name",
            &configuration.mass_spec_configuration_name,
        ),
        (
            "chromat_configuration_name",
            &configuration.chromat_configuration_name,
        ),
    ];
    for (field, value) in configured {
        if let Some(value) = value {
            base.insert(field.to_string(), value.clone());
        }
    }

    files
        .iter()
        .map(|file| {
            let mut fields = base.clone();
            for (field, overrides) in &configuration.metadata_overrides {
                if let Some(value) = overrides.resolve(file.file_name()) {
                    fields.insert(field.clone(), value.to_string());
                }
            }
            FileMetadata {
                file_name: file.file_name().to_string(),
                configuration: configuration.name.clone(),
                fields,
            }
        })
        .collect()
}

/// Order-preserving chunks of at most `batch_size` items.
pub fn batch<T: Clone>(files: &[T], batch_size: NonZeroUsize) -> Vec<Vec<T>> {
    files
        .chunks(batch_size.get())
        .map(|chunk| chunk.to_vec())
        .collect()
}
