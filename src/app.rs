use std::collections::HashSet;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::{self, BatchPlanner, BatchSummary};
use crate::biosample::{read_biosample_cache, write_biosample_cache};
use crate::discovery::{self, Crawler, DiscoveryLog, RemoteDirectory};
use crate::domain::{BiosampleRecord, FileCatalogEntry, MappingAssignment, file_stem};
use crate::download::{self, DownloadReport, RemoteFetcher};
use crate::error::StudyError;
use crate::inspect::{self, InspectionReport, Inspector};
use crate::mapping;
use crate::matcher::{MatchSummary, Matcher, summarize};
use crate::config::RawDataLocation;
use crate::metadata::{MetadataInputs, MetadataSummary};
use crate::nmdc::{BiosampleSource, MetadataSubmitter, UrlChecker};
use crate::objectstore::{self, ObjectFetcher, ObjectStore, UploadFailure};
use crate::process::{self, CollectedOutputs, WorkflowRunner};
use crate::retry::RetryPolicy;
use crate::state::{StepFlag, WorkflowState};
use crate::store;
use crate::submit::{self, SubmissionReport, submit_packages};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CreateStructure,
    Discover,
    Download,
    FetchBiosamples,
    MapBiosamples,
    Inspect,
    GenerateBatches,
    Process,
    Upload,
    GenerateMetadataInputs,
    Submit,
}

impl Stage {
    pub const ORDER: [Stage; 11] = [
        Stage::CreateStructure,
        Stage::Discover,
        Stage::Download,
        Stage::FetchBiosamples,
        Stage::MapBiosamples,
        Stage::Inspect,
        Stage::GenerateBatches,
        Stage::Process,
        Stage::Upload,
        Stage::GenerateMetadataInputs,
        Stage::Submit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CreateStructure => "create_structure",
            Stage::Discover => "discover",
            Stage::Download => "download",
            Stage::FetchBiosamples => "fetch_biosamples",
            Stage::MapBiosamples => "map_biosamples",
            Stage::Inspect => "inspect",
            Stage::GenerateBatches => "generate_batches",
            Stage::Process => "process",
            Stage::Upload => "upload",
            Stage::GenerateMetadataInputs => "generate_metadata_inputs",
            Stage::Submit => "submit",
        }
    }

    /// Skip trigger gating this stage.
    pub fn flag(&self) -> StepFlag {
        match self {
            Stage::CreateStructure => StepFlag::StudyStructureCreated,
            Stage::Discover => StepFlag::RemoteFilesDiscovered,
            Stage::Download => StepFlag::RawDataDownloaded,
            Stage::FetchBiosamples => StepFlag::BiosampleAttributesFetched,
            Stage::MapBiosamples => StepFlag::BiosampleMappingCompleted,
            Stage::Inspect => StepFlag::RawDataInspected,
            Stage::GenerateBatches => StepFlag::WdlsGenerated,
            Stage::Process => StepFlag::DataProcessed,
            Stage::Upload => StepFlag::ProcessedDataUploadedToMinio,
            Stage::GenerateMetadataInputs => StepFlag::MetadataMappingGenerated,
            Stage::Submit => StepFlag::MetadataPackagesSubmitted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome<T> {
    pub stage: Stage,
    pub skipped: bool,
    /// Items that failed inside the stage; the flag is only set when zero.
    pub failed: usize,
    pub value: T,
}

impl<T> StageOutcome<T> {
    pub fn record(&self) -> StageRecord {
        StageRecord {
            stage: self.stage,
            skipped: self.skipped,
            failed: self.failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub skipped: bool,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub catalog: Vec<FileCatalogEntry>,
    pub preview: Vec<String>,
    pub crawl_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingResult {
    pub summary: MatchSummary,
    pub mapped_files: usize,
    pub mapping_path: Utf8PathBuf,
    #[serde(skip)]
    pub assignments: Vec<MappingAssignment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub summary: BatchSummary,
    pub validated_descriptors: usize,
    pub runner_script: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub source: Utf8PathBuf,
    pub prefix: String,
    pub target: Option<String>,
    pub uploaded: usize,
    /// Files already in the bucket with the same size.
    pub unchanged: usize,
    pub failures: Vec<UploadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlagStatus {
    pub name: String,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub study_name: String,
    pub study_id: String,
    pub workflow_name: String,
    pub workflow_type: Option<String>,
    pub massive_id: Option<String>,
    pub config_path: Utf8PathBuf,
    pub workflow_root: Utf8PathBuf,
    pub raw_data_dir: Utf8PathBuf,
    pub processed_data_dir: Utf8PathBuf,
    pub flags: Vec<FlagStatus>,
}

/// Runs the study pipeline stage by stage against a persisted workflow state.
pub struct StudyManager<R, B, I, W, O, S> {
    state: WorkflowState,
    remote: R,
    nmdc: B,
    inspector: I,
    runner: W,
    object_store: O,
    submitter: S,
    retry: RetryPolicy,
}

impl<R, B, I, W, O, S> StudyManager<R, B, I, W, O, S>
where
    R: RemoteDirectory + RemoteFetcher,
    B: BiosampleSource + UrlChecker,
    I: Inspector,
    W: WorkflowRunner,
    O: ObjectStore,
    S: MetadataSubmitter,
{
    pub fn new(
        state: WorkflowState,
        remote: R,
        nmdc: B,
        inspector: I,
        runner: W,
        object_store: O,
        submitter: S,
    ) -> Self {
        Self {
            state,
            remote,
            nmdc,
            inspector,
            runner,
            object_store,
            submitter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn status(&self) -> WorkflowStatus {
        let config = self.state.config();
        WorkflowStatus {
            study_name: config.study.name.clone(),
            study_id: config.study.id.clone(),
            workflow_name: config.workflow.name.clone(),
            workflow_type: config.workflow.workflow_type.map(|wt| wt.to_string()),
            massive_id: config.workflow.massive_id.clone(),
            config_path: self.state.path().to_path_buf(),
            workflow_root: config.store.workflow_root().to_path_buf(),
            raw_data_dir: config.store.raw_data_dir().to_path_buf(),
            processed_data_dir: config.store.processed_data_dir().to_path_buf(),
            flags: self
                .state
                .flags()
                .into_iter()
                .map(|(name, done)| FlagStatus { name, done })
                .collect(),
        }
    }

    /// Clears one skip trigger, or all of them when `flag` is `None`.
    pub fn reset(&mut self, flag: Option<&str>) -> Result<WorkflowStatus, StudyError> {
        match flag {
            None => self.state.reset_all(true)?,
            Some(flag) => {
                if !self.state.flags().iter().any(|(name, _)| name == flag) {
                    return Err(StudyError::Configuration(format!(
                        "unknown skip trigger: {flag}"
                    )));
                }
                self.state.set_flag(flag, false, true)?;
            }
        }
        Ok(self.status())
    }

    /// Every stage in order. Stops at the first stage that left failed items.
    pub fn run_all(&mut self, sink: &dyn ProgressSink) -> Result<RunSummary, StudyError> {
        let mut stages = Vec::new();
        push_record(&mut stages, self.create_structure(sink)?.record())?;
        push_record(&mut stages, self.discover(sink)?.record())?;
        push_record(&mut stages, self.download(sink)?.record())?;
        push_record(&mut stages, self.fetch_biosamples(sink)?.record())?;
        push_record(&mut stages, self.map_biosamples(sink)?.record())?;
        push_record(&mut stages, self.inspect(sink)?.record())?;
        push_record(&mut stages, self.generate_batches(sink)?.record())?;
        push_record(&mut stages, self.process(None, sink)?.record())?;
        push_record(&mut stages, self.upload(sink)?.record())?;
        push_record(&mut stages, self.generate_metadata_inputs(sink)?.record())?;
        push_record(&mut stages, self.submit(sink)?.record())?;
        info!(stages = stages.len(), "pipeline finished");
        Ok(RunSummary { stages })
    }

    pub fn create_structure(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<Vec<Utf8PathBuf>>, StudyError> {
        let stage = Stage::CreateStructure;
        let config = self.state.config();
        let names: Vec<&str> = config
            .configurations
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        if self.gate(stage, sink) {
            return Ok(skipped(stage, config.store.structure(&names)));
        }
        let started = Instant::now();
        let dirs = config.store.create_structure(&names)?;
        info!(dirs = dirs.len(), root = %config.store.workflow_root(), "study structure created");
        self.finish(stage, 0, dirs, started, sink)
    }

    pub fn discover(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<DiscoveryResult>, StudyError> {
        let stage = Stage::Discover;
        let config = self.state.config();
        let catalog_path = config.store.catalog_path();
        if self.gate(stage, sink) {
            let catalog = read_required(&catalog_path, "discovery catalog", discovery::read_catalog)?;
            let preview = discovery::preview(&catalog);
            return Ok(skipped(
                stage,
                DiscoveryResult {
                    catalog,
                    preview,
                    crawl_failed: false,
                },
            ));
        }

        let started = Instant::now();
        let extension = config.study.file_type.clone();
        let (log, crawl_failed) = match config.workflow.massive_id.clone() {
            Some(massive_id) => {
                let base_url = format!("ftp://{}", config.ftp_host);
                emit(sink, stage, &format!("crawling {base_url}/{massive_id}"));
                let mut crawler = Crawler::new(&base_url, &extension);
                match crawler.crawl(&mut self.remote, &massive_id) {
                    Ok(log) => (log, false),
                    Err(err) => {
                        warn!(error = %err, massive_id = %massive_id, "remote crawl failed");
                        (DiscoveryLog::failed(), true)
                    }
                }
            }
            // Without a MassIVE dataset the raw files live under `<study>/raw` in the bucket.
            None => {
                self.object_store.ensure_ready()?;
                let prefix = format!("{}/raw/", config.study.name);
                emit(sink, stage, &format!("listing {}", self.object_store.location(&prefix)));
                match self.object_store.list(&prefix) {
                    Ok(objects) => {
                        info!(objects = objects.len(), prefix = %prefix, "object store listing finished");
                        let lines = objects
                            .iter()
                            .map(|object| self.object_store.location(&object.key))
                            .collect();
                        (DiscoveryLog { lines }, false)
                    }
                    Err(err) => {
                        warn!(error = %err, prefix = %prefix, "object store listing failed");
                        (DiscoveryLog::failed(), true)
                    }
                }
            }
        };
        store::ensure_dir(&config.store.raw_file_info_dir())?;
        log.write(&config.store.discovery_log_path())?;

        let catalog = discovery::parse_and_filter(&log, &extension, &config.workflow.file_filters);
        discovery::write_catalog(&catalog_path, &catalog)?;
        let preview = discovery::preview(&catalog);
        emit(sink, stage, &format!("{} files in catalog", catalog.len()));

        let result = DiscoveryResult {
            catalog,
            preview,
            crawl_failed,
        };
        self.finish(stage, usize::from(crawl_failed), result, started, sink)
    }

    pub fn download(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<DownloadReport>, StudyError> {
        let stage = Stage::Download;
        let config = self.state.config();
        let downloaded_path = config.store.downloaded_files_path();
        if self.gate(stage, sink) {
            let files = read_required(&downloaded_path, "downloaded files list", download::read_downloaded_files)?;
            let report = DownloadReport {
                already_present: files.len(),
                files,
                ..DownloadReport::default()
            };
            return Ok(skipped(stage, report));
        }

        let catalog = read_required(&config.store.catalog_path(), "discovery catalog", discovery::read_catalog)?;
        let started = Instant::now();
        emit(sink, stage, &format!("{} catalog entries", catalog.len()));
        let report = if config.workflow.massive_id.is_some() {
            download::download_catalog(&mut self.remote, &catalog, config.store.raw_data_dir(), self.retry)?
        } else {
            self.object_store.ensure_ready()?;
            download::download_catalog(
                &mut ObjectFetcher::new(&self.object_store),
                &catalog,
                config.store.raw_data_dir(),
                self.retry,
            )?
        };
        store::ensure_dir(&config.store.metadata_dir())?;
        download::write_downloaded_files(&downloaded_path, &report.files)?;
        if !report.failures.is_empty() {
            download::write_failures(&config.store.download_errors_path(), &report.failures)?;
        }
        let failed = report.failures.len();
        self.finish(stage, failed, report, started, sink)
    }

    pub fn fetch_biosamples(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<Vec<BiosampleRecord>>, StudyError> {
        let stage = Stage::FetchBiosamples;
        let config = self.state.config();
        let cache_path = config.store.biosample_attributes_path();
        if self.gate(stage, sink) {
            let records = read_required(&cache_path, "biosample attributes", read_biosample_cache)?;
            return Ok(skipped(stage, records));
        }

        let started = Instant::now();
        emit(sink, stage, &format!("querying biosamples of {}", config.study.id));
        let records = self.nmdc.biosamples_for_study(&config.study.id)?;
        if records.is_empty() {
            return Err(StudyError::MissingInput(format!(
                "no biosamples associated with study {}",
                config.study.id
            )));
        }
        store::ensure_dir(&config.store.metadata_dir())?;
        write_biosample_cache(&cache_path, &records)?;
        info!(biosamples = records.len(), path = %cache_path, "biosample attributes cached");
        self.finish(stage, 0, records, started, sink)
    }

    pub fn map_biosamples(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<MappingResult>, StudyError> {
        let stage = Stage::MapBiosamples;
        let config = self.state.config();
        let store = &config.store;
        let mapping_path = store.mapping_path();
        let biosamples = read_required(
            &store.biosample_attributes_path(),
            "biosample attributes",
            read_biosample_cache,
        );

        if self.gate(stage, sink) {
            let assignments = read_required(&mapping_path, "biosample mapping", mapping::read_mapping)?;
            let total_biosamples = biosamples.map(|records| records.len()).unwrap_or(0);
            let mapped = mapping::mapped_files(&assignments, store.raw_data_dir());
            return Ok(skipped(
                stage,
                MappingResult {
                    summary: summarize(&assignments, total_biosamples),
                    mapped_files: mapped.len(),
                    mapping_path,
                    assignments,
                },
            ));
        }

        let biosamples = biosamples?;
        let files = self.mappable_files()?;
        let started = Instant::now();
        if files.is_empty() {
            // Flag stays unset so a rerun after a successful discovery maps again.
            warn!("no raw files to map; writing an empty mapping");
            emit(sink, stage, "no raw files to map");
            mapping::write_mapping(&mapping_path, &[])?;
            mapping::write_mapped_files(&store.mapped_files_path(), &[])?;
            return Ok(StageOutcome {
                stage,
                skipped: false,
                failed: 0,
                value: MappingResult {
                    summary: summarize(&[], biosamples.len()),
                    mapped_files: 0,
                    mapping_path,
                    assignments: Vec::new(),
                },
            });
        }
        emit(
            sink,
            stage,
            &format!("{} files against {} biosamples", files.len(), biosamples.len()),
        );

        let report = Matcher::new(&config.matching, &biosamples).run(&files);
        mapping::write_mapping(&mapping_path, &report.assignments)?;
        let mapped = mapping::mapped_files(&report.assignments, store.raw_data_dir());
        mapping::write_mapped_files(&store.mapped_files_path(), &mapped)?;

        let result = MappingResult {
            summary: report.summary,
            mapped_files: mapped.len(),
            mapping_path,
            assignments: report.assignments,
        };
        self.finish(stage, 0, result, started, sink)
    }

    pub fn inspect(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<InspectionReport>, StudyError> {
        let stage = Stage::Inspect;
        let config = self.state.config();
        let results_path = config.store.inspection_results_path();
        if self.gate(stage, sink) {
            let records = read_required(&results_path, "inspection results", inspect::read_inspection_results)?;
            let report = InspectionReport {
                already_done: records.len(),
                records,
                ..InspectionReport::default()
            };
            return Ok(skipped(stage, report));
        }

        self.inspector.ensure_ready()?;
        let mapped = read_required(
            &config.store.mapped_files_path(),
            "mapped files list",
            mapping::read_mapped_files,
        )?;
        let mut files = Vec::new();
        for file in mapped {
            if file.raw_file_path.is_file() {
                files.push(file.raw_file_path);
            } else {
                warn!(file = %file.raw_file_path, "mapped file not on disk; not inspected");
            }
        }
        if files.is_empty() {
            return Err(StudyError::MissingInput(
                "none of the mapped raw files are on disk".to_string(),
            ));
        }

        let started = Instant::now();
        emit(
            sink,
            stage,
            &format!("{} files, {} workers", files.len(), config.inspector.max_workers),
        );
        store::ensure_dir(&config.store.raw_file_info_dir())?;
        let report = inspect::inspect_files(
            &self.inspector,
            &files,
            &results_path,
            &config.store.inspection_errors_path(),
            config.inspector.max_workers,
            self.retry,
        )?;
        let failed = report.failures.len();
        self.finish(stage, failed, report, started, sink)
    }

    pub fn generate_batches(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<BatchResult>, StudyError> {
        let stage = Stage::GenerateBatches;
        let config = self.state.config();
        let store = &config.store;
        let runner_script = store.runner_script_path(&config.workflow.name);
        if self.gate(stage, sink) {
            let descriptors = batch::existing_descriptors(&store.wdl_jsons_dir())?;
            return Ok(skipped(
                stage,
                BatchResult {
                    validated_descriptors: descriptors.len(),
                    summary: BatchSummary {
                        descriptors,
                        ..BatchSummary::default()
                    },
                    runner_script,
                },
            ));
        }

        let workflow_type = config.workflow.workflow_type.ok_or_else(|| {
            StudyError::Configuration(
                "workflow.workflow_type is required to generate batch descriptors".to_string(),
            )
        })?;
        let started = Instant::now();
        let assignments = read_required(&store.mapping_path(), "biosample mapping", mapping::read_mapping)?;
        let mapped = mapping::mapped_files(&assignments, store.raw_data_dir());
        mapping::write_mapped_files(&store.mapped_files_path(), &mapped)?;

        let results_path = store.inspection_results_path();
        let write_times = if results_path.exists() {
            inspect::write_times(&inspect::read_inspection_results(&results_path)?)
        } else if workflow_type.is_gcms() {
            return Err(StudyError::MissingInput(format!(
                "GCMS batches need inspection results at {results_path}"
            )));
        } else {
            Default::default()
        };

        emit(sink, stage, &format!("{} mapped files", mapped.len()));
        let planner = BatchPlanner {
            workflow_type,
            store,
            batch_size: config.workflow.batch_size,
            problem_files: &config.problem_files,
            write_times: &write_times,
        };
        let summary = planner.generate(&mapped, &config.configurations)?;
        let validated_descriptors = batch::validate_descriptors(&store.wdl_jsons_dir())?;
        store::ensure_dir(&store.scripts_dir())?;
        batch::write_runner_script(
            &runner_script,
            &store.wdl_jsons_dir(),
            workflow_type,
            &config.study.name,
            &config.study.id,
        )?;

        let result = BatchResult {
            summary,
            validated_descriptors,
            runner_script,
        };
        self.finish(stage, 0, result, started, sink)
    }

    /// Checks every batch descriptor's references; not gated by any flag.
    pub fn validate_batches(&self, sink: &dyn ProgressSink) -> Result<usize, StudyError> {
        let dir = self.state.config().store.wdl_jsons_dir();
        emit(sink, Stage::GenerateBatches, &format!("validating descriptors in {dir}"));
        batch::validate_descriptors(&dir)
    }

    /// Runs the runner script from `working_dir` (default `wdl_execution`)
    /// and moves finished outputs into the processed data directory.
    pub fn process(
        &mut self,
        working_dir: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<CollectedOutputs>, StudyError> {
        let stage = Stage::Process;
        let config = self.state.config();
        let store = &config.store;
        if self.gate(stage, sink) {
            let processed = match config.workflow.workflow_type {
                Some(workflow_type) => process::processed_outputs(workflow_type, store.processed_data_dir())?,
                None => Vec::new(),
            };
            return Ok(skipped(
                stage,
                CollectedOutputs {
                    already_present: processed.len(),
                    processed,
                    ..CollectedOutputs::default()
                },
            ));
        }
        let workflow_type = config.workflow.workflow_type.ok_or_else(|| {
            StudyError::Configuration("workflow.workflow_type is required to process data".to_string())
        })?;
        let script = store.runner_script_path(&config.workflow.name);
        if !script.is_file() {
            return Err(StudyError::MissingInput(format!(
                "runner script {script} does not exist; generate batches first"
            )));
        }
        self.runner.ensure_ready()?;

        let working_dir = working_dir
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| store.wdl_execution_dir());
        let started = Instant::now();
        emit(sink, stage, &format!("running {script} in {working_dir}"));
        let run = self.runner.run(&script, &working_dir);
        if let Err(err) = &run {
            warn!(error = %err, "workflow runner reported failures; collecting finished outputs");
        }

        let raw_stems: HashSet<String> = mapping::read_mapped_files(&store.mapped_files_path())
            .map(|files| {
                files
                    .iter()
                    .map(|file| file_stem(file.file_name()).to_string())
                    .collect()
            })
            .unwrap_or_default();
        let collected = process::collect_outputs(
            workflow_type,
            &working_dir,
            store.processed_data_dir(),
            &raw_stems,
        )?;
        let failed = usize::from(run.is_err());
        self.finish(stage, failed, collected, started, sink)
    }

    pub fn upload(&mut self, sink: &dyn ProgressSink) -> Result<StageOutcome<UploadResult>, StudyError> {
        let stage = Stage::Upload;
        let config = self.state.config();
        let source = config.store.processed_data_dir().to_path_buf();
        let prefix = format!(
            "{}/{}",
            config.study.name,
            source.file_name().unwrap_or("processed")
        );
        if self.gate(stage, sink) {
            return Ok(skipped(
                stage,
                UploadResult {
                    source,
                    prefix,
                    target: None,
                    uploaded: 0,
                    unchanged: 0,
                    failures: Vec::new(),
                },
            ));
        }

        self.object_store.ensure_ready()?;
        let has_content = std::fs::read_dir(source.as_std_path())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_content {
            return Err(StudyError::MissingInput(format!(
                "processed data directory {source} is missing or empty"
            )));
        }
        let started = Instant::now();
        emit(sink, stage, &format!("uploading {source}"));
        let report = objectstore::upload_dir(&self.object_store, &source, &prefix, self.retry)?;
        let failed = report.failures.len();
        let result = UploadResult {
            source,
            prefix,
            target: Some(report.target),
            uploaded: report.uploaded.len(),
            unchanged: report.unchanged,
            failures: report.failures,
        };
        self.finish(stage, failed, result, started, sink)
    }

    pub fn generate_metadata_inputs(
        &mut self,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<MetadataSummary>, StudyError> {
        let stage = Stage::GenerateMetadataInputs;
        let config = self.state.config();
        let store = &config.store;
        if self.gate(stage, sink) {
            let files_written = store::list_files_with_ext(&store.metadata_inputs_dir(), "csv")?;
            return Ok(skipped(
                stage,
                MetadataSummary {
                    files_written,
                    ..MetadataSummary::default()
                },
            ));
        }

        let workflow_type = config.workflow.workflow_type.ok_or_else(|| {
            StudyError::Configuration(
                "workflow.workflow_type is required to generate metadata inputs".to_string(),
            )
        })?;
        let started = Instant::now();
        let assignments = read_required(&store.mapping_path(), "biosample mapping", mapping::read_mapping)?;
        let inspections = read_required(
            &store.inspection_results_path(),
            "inspection results",
            inspect::read_inspection_results,
        )?;
        let catalog_path = store.catalog_path();
        let catalog = if catalog_path.exists() {
            discovery::read_catalog(&catalog_path)?
        } else {
            Vec::new()
        };

        emit(sink, stage, &format!("{} inspected files", inspections.len()));
        let inputs = MetadataInputs {
            workflow_type,
            store,
            defaults: &config.metadata,
            configurations: &config.configurations,
            problem_files: &config.problem_files,
            massive_id: config.workflow.massive_id.as_deref(),
            url_checker: match config.metadata.raw_data_location {
                RawDataLocation::Massive => Some(&self.nmdc as &dyn UrlChecker),
                RawDataLocation::Minio => None,
            },
        };
        let summary = inputs.generate(&assignments, &inspections, &catalog)?;
        self.finish(stage, 0, summary, started, sink)
    }

    pub fn submit(&mut self, sink: &dyn ProgressSink) -> Result<StageOutcome<SubmissionReport>, StudyError> {
        let stage = Stage::Submit;
        let store = &self.state.config().store;
        let report_path = store.submission_report_path();
        if self.gate(stage, sink) {
            return Ok(skipped(stage, submit::read_report(&report_path)?));
        }
        let dir = store.submission_packages_dir();
        let started = Instant::now();
        emit(sink, stage, &format!("submitting packages from {dir}"));
        let report = submit_packages(&self.submitter, &dir)?;
        submit::write_report(&report_path, &report)?;
        let failed = report.failures.len();
        self.finish(stage, failed, report, started, sink)
    }

    /// Downloaded files when the download stage ran, else the discovery catalog.
    fn mappable_files(&self) -> Result<Vec<FileCatalogEntry>, StudyError> {
        let store = &self.state.config().store;
        let downloaded = store.downloaded_files_path();
        if downloaded.exists() {
            let files = download::read_downloaded_files(&downloaded)?;
            return Ok(files.iter().map(|file| file.catalog_entry()).collect());
        }
        read_required(&store.catalog_path(), "discovery catalog", discovery::read_catalog)
    }

    fn gate(&self, stage: Stage, sink: &dyn ProgressSink) -> bool {
        let done = self.state.is_done(stage.flag());
        if done {
            info!(stage = stage.as_str(), flag = %stage.flag(), "skipping completed stage");
            emit(sink, stage, "skipped (already completed)");
        }
        done
    }

    fn finish<T>(
        &mut self,
        stage: Stage,
        failed: usize,
        value: T,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome<T>, StudyError> {
        if failed == 0 {
            self.state.mark(stage.flag())?;
        } else {
            warn!(stage = stage.as_str(), failed, "stage left failed items; flag not set");
        }
        sink.event(ProgressEvent {
            message: format!("phase={}; done, {failed} failed", stage.as_str()),
            elapsed: Some(started.elapsed()),
        });
        Ok(StageOutcome {
            stage,
            skipped: false,
            failed,
            value,
        })
    }
}

fn skipped<T>(stage: Stage, value: T) -> StageOutcome<T> {
    StageOutcome {
        stage,
        skipped: true,
        failed: 0,
        value,
    }
}

fn emit(sink: &dyn ProgressSink, stage: Stage, message: &str) {
    sink.event(ProgressEvent {
        message: format!("phase={}; {message}", stage.as_str()),
        elapsed: None,
    });
}

fn push_record(stages: &mut Vec<StageRecord>, record: StageRecord) -> Result<(), StudyError> {
    stages.push(record);
    if record.failed > 0 {
        return Err(StudyError::PartialFailure {
            stage: record.stage.as_str().to_string(),
            failed: record.failed,
        });
    }
    Ok(())
}

fn read_required<T>(
    path: &Utf8Path,
    what: &str,
    read: impl FnOnce(&Utf8Path) -> Result<T, StudyError>,
) -> Result<T, StudyError> {
    if !path.exists() {
        return Err(StudyError::MissingInput(format!("{what} not found at {path}")));
    }
    read(path)
}
