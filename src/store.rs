use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::error::StudyError;

/// Directory layout of one study workspace.
#[derive(Debug, Clone)]
pub struct Store {
    workflow_root: Utf8PathBuf,
    raw_data_dir: Utf8PathBuf,
    processed_data_dir: Utf8PathBuf,
}

impl Store {
    pub fn new(
        base_directory: &Utf8Path,
        data_directory: &Utf8Path,
        workflow_name: &str,
        study_name: &str,
        processed_date_tag: Option<&str>,
    ) -> Self {
        let study_data = data_directory.join(study_name);
        let processed = match processed_date_tag {
            Some(tag) if !tag.trim().is_empty() => format!("processed_{}", tag.trim()),
            _ => "processed".to_string(),
        };
        Self {
            workflow_root: base_directory.join("studies").join(workflow_name),
            raw_data_dir: study_data.join("raw"),
            processed_data_dir: study_data.join(processed),
        }
    }

    pub fn workflow_root(&self) -> &Utf8Path {
        &self.workflow_root
    }

    pub fn raw_data_dir(&self) -> &Utf8Path {
        &self.raw_data_dir
    }

    pub fn processed_data_dir(&self) -> &Utf8Path {
        &self.processed_data_dir
    }

    pub fn scripts_dir(&self) -> Utf8PathBuf {
        self.workflow_root.join("scripts")
    }

    pub fn metadata_dir(&self) -> Utf8PathBuf {
        self.workflow_root.join("metadata")
    }

    pub fn raw_file_info_dir(&self) -> Utf8PathBuf {
        self.workflow_root.join("raw_file_info")
    }

    pub fn wdl_jsons_dir(&self) -> Utf8PathBuf {
        self.workflow_root.join("wdl_jsons")
    }

    pub fn config_wdl_dir(&self, config_name: &str) -> Utf8PathBuf {
        self.wdl_jsons_dir().join(config_name)
    }

    pub fn discovery_log_path(&self) -> Utf8PathBuf {
        self.raw_file_info_dir().join("massive_ftp_locs.txt")
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.raw_file_info_dir().join("massive_ftp_locs.csv")
    }

    pub fn downloaded_files_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join("downloaded_files.csv")
    }

    pub fn download_errors_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join("download_errors.csv")
    }

    pub fn biosample_attributes_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join("biosample_attributes.csv")
    }

    pub fn mapping_path(&self) -> Utf8PathBuf {
        self.metadata_dir()
            .join("mapped_raw_file_biosample_mapping.csv")
    }

    pub fn mapped_files_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join("mapped_raw_files.csv")
    }

    pub fn inspection_results_path(&self) -> Utf8PathBuf {
        self.raw_file_info_dir()
            .join("raw_file_inspection_results.csv")
    }

    pub fn inspection_errors_path(&self) -> Utf8PathBuf {
        self.raw_file_info_dir()
            .join("raw_file_inspection_errors.csv")
    }

    pub fn metadata_inputs_dir(&self) -> Utf8PathBuf {
        self.metadata_dir().join("metadata_gen_input_csvs")
    }

    pub fn submission_packages_dir(&self) -> Utf8PathBuf {
        self.metadata_dir().join("nmdc_submission_packages")
    }

    pub fn submission_report_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join("submission_report.json")
    }

    pub fn wdl_execution_dir(&self) -> Utf8PathBuf {
        self.workflow_root.join("wdl_execution")
    }

    pub fn runner_script_path(&self, workflow_name: &str) -> Utf8PathBuf {
        self.scripts_dir()
            .join(format!("{workflow_name}_wdl_runner.sh"))
    }

    /// Creates the workflow tree and one descriptor directory per configuration.
    pub fn create_structure(&self, config_names: &[&str]) -> Result<Vec<Utf8PathBuf>, StudyError> {
        let dirs = self.structure(config_names);
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(dirs)
    }

    pub fn structure(&self, config_names: &[&str]) -> Vec<Utf8PathBuf> {
        let mut dirs = vec![
            self.scripts_dir(),
            self.metadata_dir(),
            self.wdl_jsons_dir(),
            self.raw_file_info_dir(),
            self.raw_data_dir.clone(),
            self.processed_data_dir.clone(),
        ];
        dirs.extend(config_names.iter().map(|name| self.config_wdl_dir(name)));
        dirs
    }
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), StudyError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("create {path}: {err}")))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), StudyError> {
    let mut temp = temp_sibling(path)?;
    temp.write_all(content)
        .map_err(|err| StudyError::Filesystem(err.to_string()))?;
    persist(temp, path)
}

/// Temp file next to `path` so the final rename stays on one filesystem.
pub fn temp_sibling(path: &Utf8Path) -> Result<NamedTempFile, StudyError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    ensure_dir(parent)?;
    Builder::new()
        .prefix(".nmdc-sm")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| StudyError::Filesystem(err.to_string()))
}

pub fn persist(temp: NamedTempFile, path: &Utf8Path) -> Result<(), StudyError> {
    temp.persist(path.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

pub fn list_files_with_ext(dir: &Utf8Path, ext: &str) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let mut out = Vec::new();
    if !dir.as_std_path().exists() {
        return Ok(out);
    }
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| StudyError::Filesystem(format!("read {dir}: {err}")))?;
    for entry in entries.flatten() {
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.is_file()
            && path
                .extension()
                .map(|value| value.eq_ignore_ascii_case(ext))
                .unwrap_or(false)
        {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
