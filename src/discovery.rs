//! Remote file discovery: crawl the archive, keep a plain-text discovery
//! log, then parse it into a deduplicated, keyword-filtered catalog.

use std::collections::HashSet;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::FileCatalogEntry;
use crate::error::StudyError;
use crate::store;

pub const PROGRESS_EVERY: usize = 100;
pub const FAILED_CRAWL_PLACEHOLDER: &str = "# No files found - FTP crawling failed";
pub const PREVIEW_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
}

impl RemoteEntry {
    /// Parses a unix-style LIST line; names may contain spaces.
    ///
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 sample 01.raw`
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return None;
        }
        let name = parts[8..].join(" ");
        if name == "." || name == ".." {
            return None;
        }
        Some(Self {
            name,
            is_directory: parts[0].starts_with('d'),
            size: parts[4].parse().ok(),
        })
    }
}

/// A hierarchical remote file server.
pub trait RemoteDirectory {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, StudyError>;
}

/// Plain-text discovery log: one remote address per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryLog {
    pub lines: Vec<String>,
}

impl DiscoveryLog {
    pub fn failed() -> Self {
        Self {
            lines: vec![FAILED_CRAWL_PLACEHOLDER.to_string()],
        }
    }

    pub fn read(path: &Utf8Path) -> Result<Self, StudyError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("read {path}: {err}")))?;
        Ok(Self {
            lines: content.lines().map(str::to_string).collect(),
        })
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), StudyError> {
        let mut content = self.lines.join("\n");
        content.push('\n');
        store::write_bytes_atomic(path, content.as_bytes())
    }
}

pub struct Crawler<'a> {
    base_url: &'a str,
    extension: String,
    found: usize,
}

impl<'a> Crawler<'a> {
    /// `base_url` is prepended to every collected path, e.g. `ftp://massive-ftp.ucsd.edu`.
    pub fn new(base_url: &'a str, extension: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/'),
            extension: extension.to_lowercase(),
            found: 0,
        }
    }

    /// Depth-first crawl from `root_path`. Only a failure to list the root is
    /// an error; unreadable subdirectories are skipped.
    pub fn crawl<D: RemoteDirectory>(
        &mut self,
        remote: &mut D,
        root_path: &str,
    ) -> Result<DiscoveryLog, StudyError> {
        let root = root_path.trim_matches('/');
        let entries = remote.list(root)?;
        let mut lines = Vec::new();
        self.visit(remote, root, entries, &mut lines);
        info!(files = lines.len(), root, "remote crawl finished");
        Ok(DiscoveryLog { lines })
    }

    fn visit<D: RemoteDirectory>(
        &mut self,
        remote: &mut D,
        path: &str,
        entries: Vec<RemoteEntry>,
        lines: &mut Vec<String>,
    ) {
        for entry in entries {
            let child = if path.is_empty() {
                entry.name.clone()
            } else {
                format!("{path}/{}", entry.name)
            };
            if entry.is_directory {
                match remote.list(&child) {
                    Ok(children) => self.visit(remote, &child, children, lines),
                    Err(err) => warn!(directory = %child, error = %err, "skipping unreadable directory"),
                }
            } else if entry.name.to_lowercase().ends_with(&self.extension) {
                lines.push(format!("{}/{child}", self.base_url));
                self.found += 1;
                if self.found % PROGRESS_EVERY == 0 {
                    info!(found = self.found, "crawl progress");
                }
            }
        }
    }
}

/// Catalog row as stored in `massive_ftp_locs.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogRow {
    location_uri: String,
    short_name: String,
    file_type: String,
}

pub fn parse_and_filter(log: &DiscoveryLog, extension: &str, keywords: &[String]) -> Vec<FileCatalogEntry> {
    let extension = extension.to_lowercase();
    let mut seen_locations = HashSet::new();
    let mut seen_names = HashSet::new();
    let mut entries = Vec::new();

    for line in &log.lines {
        let location = line.trim();
        if location.is_empty() || location.starts_with('#') {
            continue;
        }
        if !location.to_lowercase().ends_with(&extension) {
            continue;
        }
        if !seen_locations.insert(location.to_string()) {
            continue;
        }
        let short_name = location.rsplit('/').next().unwrap_or(location).to_string();
        if !seen_names.insert(short_name.clone()) {
            warn!(file = %short_name, location, "file name already discovered at another location; keeping the first");
            continue;
        }
        entries.push(FileCatalogEntry::new(location, short_name, &extension));
    }

    let keywords: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect();
    if keywords.is_empty() {
        warn!(
            files = entries.len(),
            "no file filters configured; every discovered file is kept"
        );
        return entries;
    }

    let before = entries.len();
    entries.retain(|entry| {
        let name = entry.short_name.to_lowercase();
        keywords.iter().any(|keyword| name.contains(keyword))
    });
    info!(
        kept = entries.len(),
        dropped = before - entries.len(),
        "applied file filters"
    );
    entries
}

pub fn write_catalog(path: &Utf8Path, entries: &[FileCatalogEntry]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in entries {
        writer.serialize(CatalogRow {
            location_uri: entry.location_uri.clone(),
            short_name: entry.short_name.clone(),
            file_type: entry.file_type.clone(),
        })?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}

pub fn read_catalog(path: &Utf8Path) -> Result<Vec<FileCatalogEntry>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    reader
        .deserialize::<CatalogRow>()
        .map(|row| {
            let row = row?;
            Ok(FileCatalogEntry::new(
                row.location_uri,
                row.short_name,
                &row.file_type,
            ))
        })
        .collect()
}

pub fn preview(entries: &[FileCatalogEntry]) -> Vec<String> {
    entries
        .iter()
        .take(PREVIEW_LEN)
        .map(|entry| entry.short_name.clone())
        .collect()
}
