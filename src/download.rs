use std::fs;
use std::io::{Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::FileCatalogEntry;
use crate::error::StudyError;
use crate::retry::RetryPolicy;
use crate::store;

/// Source of remote file content addressed by `location_uri`.
pub trait RemoteFetcher {
    fn fetch(&mut self, location_uri: &str, destination: &mut dyn Write) -> Result<u64, StudyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub location_uri: String,
    pub file_name: String,
    pub file_type: String,
    pub file_path: Utf8PathBuf,
    pub file_size_bytes: u64,
}

impl DownloadedFile {
    pub fn catalog_entry(&self) -> FileCatalogEntry {
        FileCatalogEntry {
            location_uri: self.location_uri.clone(),
            short_name: self.file_name.clone(),
            file_type: self.file_type.clone(),
            local_path: Some(self.file_path.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFailure {
    pub location_uri: String,
    pub file_name: String,
    pub error: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub files: Vec<DownloadedFile>,
    pub downloaded: usize,
    pub already_present: usize,
    pub failures: Vec<DownloadFailure>,
}

impl DownloadReport {
    /// Local catalog of every file now on disk.
    pub fn local_catalog(&self) -> Vec<FileCatalogEntry> {
        self.files.iter().map(DownloadedFile::catalog_entry).collect()
    }
}

/// Downloads every catalog entry missing from `raw_dir`. One failing file
/// never stops the loop.
pub fn download_catalog<F: RemoteFetcher>(
    fetcher: &mut F,
    catalog: &[FileCatalogEntry],
    raw_dir: &Utf8Path,
    policy: RetryPolicy,
) -> Result<DownloadReport, StudyError> {
    store::ensure_dir(raw_dir)?;
    let mut report = DownloadReport::default();

    for (idx, entry) in catalog.iter().enumerate() {
        let target = raw_dir.join(&entry.short_name);
        if let Ok(meta) = fs::metadata(target.as_std_path())
            && meta.is_file()
        {
            report.already_present += 1;
            report.files.push(downloaded(entry, target, meta.len()));
            continue;
        }

        info!(
            file = %entry.short_name,
            progress = %format!("{}/{}", idx + 1, catalog.len()),
            "downloading"
        );
        match fetch_one(fetcher, entry, &target, policy) {
            Ok(size) => {
                report.downloaded += 1;
                report.files.push(downloaded(entry, target, size));
            }
            Err(err) => {
                warn!(file = %entry.short_name, error = %err, "download failed");
                report.failures.push(DownloadFailure {
                    location_uri: entry.location_uri.clone(),
                    file_name: entry.short_name.clone(),
                    error: err.to_string(),
                    failed_at: Utc::now().to_rfc3339(),
                });
            }
        }
    }

    info!(
        downloaded = report.downloaded,
        already_present = report.already_present,
        failed = report.failures.len(),
        "download finished"
    );
    Ok(report)
}

fn fetch_one<F: RemoteFetcher>(
    fetcher: &mut F,
    entry: &FileCatalogEntry,
    target: &Utf8Path,
    policy: RetryPolicy,
) -> Result<u64, StudyError> {
    let mut temp = store::temp_sibling(target)?;
    let size = policy.run(&entry.short_name, |_| {
        let file = temp.as_file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        fetcher.fetch(&entry.location_uri, file)
    })?;
    temp.as_file_mut().flush()?;
    store::persist(temp, target)?;
    Ok(size)
}

fn downloaded(entry: &FileCatalogEntry, path: Utf8PathBuf, size: u64) -> DownloadedFile {
    DownloadedFile {
        location_uri: entry.location_uri.clone(),
        file_name: entry.short_name.clone(),
        file_type: entry.file_type.clone(),
        file_path: path,
        file_size_bytes: size,
    }
}

pub fn write_downloaded_files(path: &Utf8Path, files: &[DownloadedFile]) -> Result<(), StudyError> {
    write_rows(path, files)
}

pub fn read_downloaded_files(path: &Utf8Path) -> Result<Vec<DownloadedFile>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    reader
        .deserialize()
        .map(|row| row.map_err(StudyError::from))
        .collect()
}

pub fn write_failures(path: &Utf8Path, failures: &[DownloadFailure]) -> Result<(), StudyError> {
    write_rows(path, failures)
}

fn write_rows<T: Serialize>(path: &Utf8Path, rows: &[T]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}
