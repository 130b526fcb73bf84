//! Per-configuration CSV inputs for NMDC workflow metadata generation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::bind_calibrations;
use crate::config::{ConfigurationEntry, MetadataDefaults, RawDataLocation};
use crate::domain::{
    ControlKind, FileCatalogEntry, MappingAssignment, MatchLevel, MatchOutcome, WorkflowType,
    file_stem,
};
use crate::error::StudyError;
use crate::inspect::InspectionRecord;
use crate::nmdc::UrlChecker;
use crate::separator::{NamedFile, Separator, apply_overrides};
use crate::store::{self, Store};

const MASSIVE_DOWNLOAD_BASE: &str = "https://massive.ucsd.edu/ProteoSAFe/DownloadResultFile?file=f.";
const END_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
pub const URLS_TO_CHECK: usize = 5;

/// One high-confidence sample joined with its inspection row.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub file_name: String,
    pub sample_id: String,
    pub raw_data_file: Utf8PathBuf,
    pub acquired_at: NaiveDateTime,
    pub instrument_instance_specifier: String,
    pub raw_data_url: Option<String>,
}

impl NamedFile for SampleInput {
    fn file_name(&self) -> &str {
        &self.file_name
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataSummary {
    pub files_written: Vec<Utf8PathBuf>,
    pub rows: usize,
    pub missing_inspection: Vec<String>,
    pub problem_files_excluded: usize,
    pub degraded: bool,
    pub url_check: Option<UrlCheck>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UrlCheck {
    pub tested: usize,
    pub reachable: usize,
}

pub struct MetadataInputs<'a> {
    pub workflow_type: WorkflowType,
    pub store: &'a Store,
    pub defaults: &'a MetadataDefaults,
    pub configurations: &'a [ConfigurationEntry],
    pub problem_files: &'a BTreeSet<String>,
    pub massive_id: Option<&'a str>,
    /// Checks the first generated raw data URLs when set.
    pub url_checker: Option<&'a dyn UrlChecker>,
}

impl MetadataInputs<'_> {
    pub fn generate(
        &self,
        assignments: &[MappingAssignment],
        inspections: &[InspectionRecord],
        catalog: &[FileCatalogEntry],
    ) -> Result<MetadataSummary, StudyError> {
        let mut summary = MetadataSummary::default();
        let samples = self.join_samples(assignments, inspections, catalog, &mut summary)?;
        if samples.is_empty() {
            return Err(StudyError::MissingInput(
                "no high-confidence sample has usable inspection metadata".to_string(),
            ));
        }
        if let Some(checker) = self.url_checker {
            let urls: Vec<&str> = samples
                .iter()
                .filter_map(|sample| sample.raw_data_url.as_deref())
                .collect();
            if !urls.is_empty() {
                summary.url_check = Some(check_urls(checker, &urls, URLS_TO_CHECK)?);
            }
        }

        let calibrations: Vec<String> = assignments
            .iter()
            .filter(|assignment| {
                matches!(
                    assignment.outcome,
                    MatchOutcome::Control {
                        kind: ControlKind::Calibration
                    }
                )
            })
            .map(|assignment| assignment.raw_file_name.clone())
            .collect();
        let calibration_for = if self.workflow_type.is_gcms() {
            self.calibration_lookup(&samples, &calibrations, inspections)?
        } else {
            HashMap::new()
        };

        let out_dir = self.store.metadata_inputs_dir();
        store::ensure_dir(&out_dir)?;
        for stale in store::list_files_with_ext(&out_dir, "csv")? {
            fs::remove_file(stale.as_std_path())
                .map_err(|err| StudyError::Filesystem(format!("remove {stale}: {err}")))?;
        }

        let separator = Separator::new(self.configurations);
        let separation = separator.assign(&samples);
        summary.degraded = separation.degraded;
        for subset in &separation.subsets {
            let fields = apply_overrides(&subset.files, subset.configuration, self.defaults);
            let path = out_dir.join(format!("{}_metadata.csv", subset.configuration.name));
            let rows: Vec<Vec<String>> = subset
                .files
                .iter()
                .zip(&fields)
                .map(|(sample, metadata)| {
                    self.row(sample, &metadata.fields, calibration_for.get(&sample.file_name))
                })
                .collect();
            write_table(&path, &self.columns(), &rows)?;
            info!(
                configuration = %subset.configuration.name,
                rows = rows.len(),
                path = %path,
                "metadata inputs written"
            );
            summary.rows += rows.len();
            summary.files_written.push(path);
        }
        if summary.files_written.is_empty() {
            return Err(StudyError::MissingInput(
                "no metadata input file was written".to_string(),
            ));
        }
        Ok(summary)
    }

    fn join_samples(
        &self,
        assignments: &[MappingAssignment],
        inspections: &[InspectionRecord],
        catalog: &[FileCatalogEntry],
        summary: &mut MetadataSummary,
    ) -> Result<Vec<SampleInput>, StudyError> {
        let high: Vec<(&str, &str)> = assignments
            .iter()
            .filter_map(|assignment| match &assignment.outcome {
                MatchOutcome::Matched {
                    biosample_id,
                    level: MatchLevel::High,
                    ..
                } => Some((assignment.raw_file_name.as_str(), biosample_id.as_str())),
                _ => None,
            })
            .collect();
        if high.is_empty() {
            return Err(StudyError::MissingInput(
                "no high-confidence biosample matches in the mapping".to_string(),
            ));
        }

        let mut timed: HashMap<&str, &InspectionRecord> = HashMap::new();
        let mut untimed = 0usize;
        for record in inspections {
            if record.acquired_at().is_some() {
                timed.entry(record.file_name.as_str()).or_insert(record);
            } else {
                untimed += 1;
            }
        }
        if untimed > 0 {
            warn!(files = untimed, "excluding inspected files without a write time");
        }

        let locations: HashMap<&str, &str> = catalog
            .iter()
            .map(|entry| (entry.short_name.as_str(), entry.location_uri.as_str()))
            .collect();
        let massive_id = match self.defaults.raw_data_location {
            RawDataLocation::Massive => Some(self.massive_id.ok_or_else(|| {
                StudyError::Configuration(
                    "workflow.massive_id is required to build MassIVE raw data URLs".to_string(),
                )
            })?),
            RawDataLocation::Minio => None,
        };

        let mut samples = Vec::new();
        for (file_name, biosample_id) in high {
            if self.problem_files.contains(file_name) {
                summary.problem_files_excluded += 1;
                continue;
            }
            let Some(record) = timed.get(file_name) else {
                summary.missing_inspection.push(file_name.to_string());
                continue;
            };
            let Some(acquired_at) = record.acquired_at() else {
                continue;
            };
            let serial = record
                .instrument_serial_number
                .clone()
                .unwrap_or_default();
            let instrument_instance_specifier =
                if self.defaults.serial_numbers_to_remove.contains(&serial) {
                    String::new()
                } else {
                    serial
                };
            samples.push(SampleInput {
                file_name: file_name.to_string(),
                sample_id: biosample_id.to_string(),
                raw_data_file: self.store.raw_data_dir().join(file_name),
                acquired_at,
                instrument_instance_specifier,
                raw_data_url: massive_id
                    .map(|id| massive_url(id, file_name, locations.get(file_name).copied())),
            });
        }
        if !summary.missing_inspection.is_empty() {
            warn!(
                files = summary.missing_inspection.len(),
                preview = ?summary.missing_inspection.iter().take(5).collect::<Vec<_>>(),
                "high-confidence files without inspection metadata are excluded"
            );
        }
        Ok(samples)
    }

    fn calibration_lookup(
        &self,
        samples: &[SampleInput],
        calibrations: &[String],
        inspections: &[InspectionRecord],
    ) -> Result<HashMap<String, Utf8PathBuf>, StudyError> {
        if calibrations.is_empty() {
            return Err(StudyError::MissingInput(
                "GCMS metadata needs at least one calibration file in the mapping".to_string(),
            ));
        }
        let mut times: HashMap<String, NaiveDateTime> = crate::inspect::write_times(inspections);
        for sample in samples {
            times.insert(sample.file_name.clone(), sample.acquired_at);
        }
        let names: Vec<String> = samples.iter().map(|sample| sample.file_name.clone()).collect();
        let sample_refs: Vec<&String> = names.iter().collect();
        let calibration_refs: Vec<&String> = calibrations.iter().collect();

        let mut lookup = HashMap::new();
        for (calibration, bound) in bind_calibrations(&sample_refs, &calibration_refs, &times) {
            let path = self.store.raw_data_dir().join(calibration);
            for sample in bound {
                lookup.insert(sample.clone(), path.clone());
            }
        }
        Ok(lookup)
    }

    fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["sample_id", "raw_data_file"];
        if self.workflow_type.is_gcms() {
            columns.extend(["processed_data_file", "calibration_file"]);
        } else {
            columns.push("processed_data_directory");
        }
        columns.extend([
            "mass_spec_configuration_name",
            "chromat_configuration_name",
            "instrument_used",
            "processing_institution_workflow",
            "processing_institution_generation",
            "instrument_analysis_end_date",
            "instrument_instance_specifier",
        ]);
        if self.defaults.raw_data_location == RawDataLocation::Massive {
            columns.push("raw_data_url");
        }
        columns
    }

    fn row(
        &self,
        sample: &SampleInput,
        fields: &BTreeMap<String, String>,
        calibration: Option<&Utf8PathBuf>,
    ) -> Vec<String> {
        let processed = self.store.processed_data_dir();
        let stem = file_stem(&sample.file_name);
        let field = |name: &str, fallback: &str| {
            fields
                .get(name)
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };

        let mut row = vec![sample.sample_id.clone(), sample.raw_data_file.to_string()];
        if self.workflow_type.is_gcms() {
            row.push(processed.join(format!("{stem}.csv")).to_string());
            row.push(calibration.map(ToString::to_string).unwrap_or_default());
        } else {
            row.push(processed.join(format!("{stem}.corems")).to_string());
        }
        row.extend([
            field(
                "mass_spec_configuration_name",
                &self.defaults.mass_spec_configuration_name,
            ),
            field(
                "chromat_configuration_name",
                &self.defaults.chromat_configuration_name,
            ),
            field("instrument_used", &self.defaults.instrument_used),
            field(
                "processing_institution_workflow",
                &self.defaults.processing_institution_workflow,
            ),
            field(
                "processing_institution_generation",
                &self.defaults.processing_institution_generation,
            ),
            sample.acquired_at.format(END_DATE_FORMAT).to_string(),
            sample.instrument_instance_specifier.clone(),
        ]);
        if let Some(url) = &sample.raw_data_url {
            row.push(url.clone());
        }
        row
    }
}

/// Download URL of a raw file inside a MassIVE dataset.
///
/// The dataset-relative path comes from the FTP location when it contains
/// the accession, otherwise `{accession}/raw/{file}` is assumed.
pub fn massive_url(massive_id: &str, file_name: &str, ftp_location: Option<&str>) -> String {
    let accession = match massive_id.find("MSV") {
        Some(idx) => &massive_id[idx..],
        None => massive_id,
    };
    let relative = ftp_location
        .and_then(|location| {
            let start = location.find(accession)?;
            let rest = &location[start + accession.len()..];
            let dir = rest.strip_suffix(file_name)?.strip_suffix('/')?;
            (!dir.is_empty()).then(|| format!("{accession}{dir}/{file_name}"))
        })
        .unwrap_or_else(|| format!("{accession}/raw/{file_name}"));
    format!(
        "{MASSIVE_DOWNLOAD_BASE}{}&forceDownload=true",
        percent_encode(&relative)
    )
}

/// HEAD-checks up to `max` URLs. None reachable is an error; fewer than
/// half reachable only warns.
pub fn check_urls<C: UrlChecker + ?Sized>(
    checker: &C,
    urls: &[&str],
    max: usize,
) -> Result<UrlCheck, StudyError> {
    let tested = &urls[..urls.len().min(max)];
    let mut check = UrlCheck {
        tested: tested.len(),
        reachable: 0,
    };
    for (idx, url) in tested.iter().enumerate() {
        let progress = format!("{}/{}", idx + 1, tested.len());
        match checker.head_status(url) {
            Ok(200) => check.reachable += 1,
            Ok(404) => warn!(url, progress = %progress, "raw data URL not found in the dataset"),
            Ok(status) => warn!(url, status, progress = %progress, "unexpected status for raw data URL"),
            Err(err) => warn!(url, progress = %progress, error = %err, "raw data URL check failed"),
        }
    }
    if check.tested > 0 && check.reachable == 0 {
        return Err(StudyError::Configuration(format!(
            "none of the {} tested MassIVE URLs are accessible; check workflow.massive_id and the file paths",
            check.tested
        )));
    }
    if check.reachable < check.tested / 2 {
        warn!(
            reachable = check.reachable,
            tested = check.tested,
            "only some raw data URLs are accessible; files may be missing from MassIVE"
        );
    } else {
        info!(reachable = check.reachable, tested = check.tested, "raw data URLs checked");
    }
    Ok(check)
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn write_table(path: &Utf8Path, header: &[&str], rows: &[Vec<String>]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}
