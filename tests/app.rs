use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use nmdc_study_manager::app::{ProgressEvent, ProgressSink, Stage, StudyManager};
use nmdc_study_manager::discovery::{FAILED_CRAWL_PLACEHOLDER, RemoteDirectory, RemoteEntry};
use nmdc_study_manager::domain::BiosampleRecord;
use nmdc_study_manager::download::RemoteFetcher;
use nmdc_study_manager::error::StudyError;
use nmdc_study_manager::inspect::{InspectionRecord, Inspector};
use nmdc_study_manager::nmdc::{BiosampleSource, MetadataSubmitter, UrlChecker};
use nmdc_study_manager::objectstore::{ObjectInfo, ObjectStore};
use nmdc_study_manager::process::WorkflowRunner;
use nmdc_study_manager::retry::RetryPolicy;
use nmdc_study_manager::state::{StepFlag, WorkflowState};

const HOST: &str = "ftp://massive-ftp.ucsd.edu";

#[derive(Default)]
struct FakeArchive {
    dirs: HashMap<String, Vec<RemoteEntry>>,
    payloads: HashMap<String, Vec<u8>>,
}

impl FakeArchive {
    fn study(files: &[&str], missing_payloads: &[&str]) -> Self {
        let mut archive = Self::default();
        archive.dirs.insert(
            "MSV000012345".to_string(),
            vec![entry("raw", true), entry("README.txt", false)],
        );
        archive.dirs.insert(
            "MSV000012345/raw".to_string(),
            files.iter().map(|name| entry(name, false)).collect(),
        );
        for name in files {
            if !missing_payloads.contains(name) {
                archive.payloads.insert(
                    format!("{HOST}/MSV000012345/raw/{name}"),
                    format!("payload of {name}").into_bytes(),
                );
            }
        }
        archive
    }
}

fn entry(name: &str, is_directory: bool) -> RemoteEntry {
    RemoteEntry {
        name: name.to_string(),
        is_directory,
        size: None,
    }
}

impl RemoteDirectory for FakeArchive {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, StudyError> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| StudyError::Ftp(format!("550 {path}: no such directory")))
    }
}

impl RemoteFetcher for FakeArchive {
    fn fetch(&mut self, location_uri: &str, destination: &mut dyn Write) -> Result<u64, StudyError> {
        let payload = self
            .payloads
            .get(location_uri)
            .ok_or_else(|| StudyError::Ftp(format!("550 {location_uri}: no such file")))?;
        destination.write_all(payload)?;
        Ok(payload.len() as u64)
    }
}

struct FakeNmdc(Vec<BiosampleRecord>);

impl BiosampleSource for FakeNmdc {
    fn biosamples_for_study(&self, _study_id: &str) -> Result<Vec<BiosampleRecord>, StudyError> {
        Ok(self.0.clone())
    }
}

impl UrlChecker for FakeNmdc {
    fn head_status(&self, _url: &str) -> Result<u16, StudyError> {
        Ok(200)
    }
}

struct NoDocker;

impl Inspector for NoDocker {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        Err(StudyError::Container("daemon not running".to_string()))
    }

    fn inspect(&self, file: &Utf8Path) -> Result<InspectionRecord, StudyError> {
        Err(StudyError::Container(format!("cannot inspect {file}")))
    }
}

struct IdleRunner;

impl WorkflowRunner for IdleRunner {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        Ok(())
    }

    fn run(&self, _script: &Utf8Path, _working_dir: &Utf8Path) -> Result<(), StudyError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeBucket {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeBucket {
    fn with(objects: &[&str]) -> Self {
        let bucket = Self::default();
        for key in objects {
            bucket
                .objects
                .lock()
                .unwrap()
                .insert(key.to_string(), format!("object {key}").into_bytes());
        }
        bucket
    }
}

impl ObjectStore for FakeBucket {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        Ok(())
    }

    fn object_size(&self, key: &str) -> Result<Option<u64>, StudyError> {
        Ok(self.objects.lock().unwrap().get(key).map(|body| body.len() as u64))
    }

    fn put_file(&self, path: &Utf8Path, key: &str) -> Result<(), StudyError> {
        let body = fs::read(path.as_std_path())?;
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StudyError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectInfo {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    fn fetch(&self, key: &str, destination: &mut dyn Write) -> Result<u64, StudyError> {
        let objects = self.objects.lock().unwrap();
        let body = objects
            .get(key)
            .ok_or_else(|| StudyError::ObjectStore(format!("get {key}: NoSuchKey")))?;
        destination.write_all(body)?;
        Ok(body.len() as u64)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://metabolomics/{key}")
    }
}

struct FakeSubmitter;

impl MetadataSubmitter for FakeSubmitter {
    fn validate(&self, package: &Value) -> Result<(), StudyError> {
        if package.get("data_object_set").is_none() {
            return Err(StudyError::HttpStatus {
                status: 422,
                message: "data_object_set is required".to_string(),
            });
        }
        Ok(())
    }

    fn submit(&self, _package: &Value) -> Result<String, StudyError> {
        Ok("accepted".to_string())
    }
}

#[derive(Default)]
struct Recorder(RefCell<Vec<String>>);

impl ProgressSink for Recorder {
    fn event(&self, event: ProgressEvent) {
        self.0.borrow_mut().push(event.message);
    }
}

type Manager = StudyManager<FakeArchive, FakeNmdc, NoDocker, IdleRunner, FakeBucket, FakeSubmitter>;

fn biosample(id: &str, name: &str) -> BiosampleRecord {
    BiosampleRecord {
        id: id.to_string(),
        name: name.to_string(),
        samp_name: None,
        submitter_id: None,
        external_accessions: Vec::new(),
    }
}

fn write_config(root: &Utf8Path, massive_id: Option<&str>) -> Utf8PathBuf {
    let mut document = json!({
        "study": {"name": "kroeger", "id": "nmdc:sty-11-dwsv7q78", "file_type": ".raw"},
        "workflow": {
            "name": "kroeger_lcms",
            "workflow_type": "LCMS Metabolomics",
            "processed_data_date_tag": "20250101"
        },
        "paths": {"base_directory": root.join("work"), "data_directory": root.join("data")},
        "matching": {"control_patterns": ["blank"]},
        "notes": "kept as written"
    });
    if let Some(id) = massive_id {
        document["workflow"]["massive_id"] = json!(id);
    }
    let path = root.join("study_config.json");
    fs::write(path.as_std_path(), document.to_string()).unwrap();
    path
}

fn manager(root: &Utf8Path, archive: FakeArchive, biosamples: Vec<BiosampleRecord>) -> Manager {
    let config = write_config(root, Some("MSV000012345"));
    manager_for(&config, archive, biosamples, FakeBucket::default())
}

fn manager_for(
    config: &Utf8Path,
    archive: FakeArchive,
    biosamples: Vec<BiosampleRecord>,
    bucket: FakeBucket,
) -> Manager {
    let state = WorkflowState::load(config).unwrap();
    StudyManager::new(
        state,
        archive,
        FakeNmdc(biosamples),
        NoDocker,
        IdleRunner,
        bucket,
        FakeSubmitter,
    )
    .with_retry_policy(RetryPolicy::immediate(0))
}

/// Study config with `flags` already set, as after an earlier run.
fn config_with_flags(root: &Utf8Path, flags: &[StepFlag]) -> Utf8PathBuf {
    let path = write_config(root, Some("MSV000012345"));
    let content = fs::read_to_string(path.as_std_path()).unwrap();
    let mut document: Value = serde_json::from_str(&content).unwrap();
    for flag in flags {
        document["skip_triggers"][flag.as_str()] = json!(true);
    }
    fs::write(path.as_std_path(), document.to_string()).unwrap();
    path
}

fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn persisted_flag(config: &Utf8Path, flag: StepFlag) -> bool {
    let content = fs::read_to_string(config.as_std_path()).unwrap();
    let document: Value = serde_json::from_str(&content).unwrap();
    document["skip_triggers"][flag.as_str()].as_bool().unwrap()
}

#[test]
fn stages_own_the_flags_in_order() {
    let flags: Vec<StepFlag> = Stage::ORDER.iter().map(Stage::flag).collect();
    assert_eq!(flags, StepFlag::ALL.to_vec());
}

#[test]
fn discover_download_and_map_a_study() {
    let (_dir, root) = tempdir();
    let archive = FakeArchive::study(&["S1_pos.raw", "S2_pos.raw", "blank_1.raw"], &[]);
    let biosamples = vec![
        biosample("nmdc:bsm-11-aaa", "S1 root"),
        biosample("nmdc:bsm-11-bbb", "S2 leaf"),
    ];
    let mut manager = manager(&root, archive, biosamples);
    let sink = Recorder::default();

    let structure = manager.create_structure(&sink).unwrap();
    assert!(!structure.skipped);
    assert!(structure.value.iter().all(|dir| dir.is_dir()));

    let discovered = manager.discover(&sink).unwrap();
    assert!(!discovered.value.crawl_failed);
    assert_eq!(discovered.value.catalog.len(), 3);
    assert_eq!(
        discovered.value.catalog[0].location_uri,
        format!("{HOST}/MSV000012345/raw/S1_pos.raw")
    );

    let downloaded = manager.download(&sink).unwrap();
    assert_eq!(downloaded.failed, 0);
    assert_eq!(downloaded.value.downloaded, 3);
    let raw_dir = manager.state().config().store.raw_data_dir().to_path_buf();
    assert_eq!(
        fs::read_to_string(raw_dir.join("S2_pos.raw").as_std_path()).unwrap(),
        "payload of S2_pos.raw"
    );

    let fetched = manager.fetch_biosamples(&sink).unwrap();
    assert_eq!(fetched.value.len(), 2);

    let mapped = manager.map_biosamples(&sink).unwrap();
    assert_eq!(mapped.value.summary.total_files, 3);
    assert_eq!(mapped.value.summary.control_files, 1);
    assert_eq!(mapped.value.summary.matched, 2);
    assert_eq!(mapped.value.mapped_files, 3);
    assert_eq!(mapped.value.summary.biosamples_with_files, 2);
    assert!(mapped.value.mapping_path.is_file());

    for flag in [
        StepFlag::StudyStructureCreated,
        StepFlag::RemoteFilesDiscovered,
        StepFlag::RawDataDownloaded,
        StepFlag::BiosampleAttributesFetched,
        StepFlag::BiosampleMappingCompleted,
    ] {
        assert!(manager.state().is_done(flag), "{flag} should be set");
        assert!(persisted_flag(manager.state().path(), flag));
    }
    assert!(!manager.state().is_done(StepFlag::RawDataInspected));
    assert_eq!(manager.state().document()["notes"], json!("kept as written"));
    assert!(
        sink.0
            .borrow()
            .iter()
            .any(|message| message.starts_with("phase=download;"))
    );
}

#[test]
fn completed_stages_are_skipped_and_reload_their_outputs() {
    let (_dir, root) = tempdir();
    let archive = FakeArchive::study(&["S1_pos.raw", "S2_pos.raw"], &[]);
    let mut manager = manager(&root, archive, Vec::new());
    let sink = Recorder::default();

    manager.create_structure(&sink).unwrap();
    manager.discover(&sink).unwrap();
    manager.download(&sink).unwrap();

    let again = manager.discover(&sink).unwrap();
    assert!(again.skipped);
    assert_eq!(again.value.preview, vec!["S1_pos.raw", "S2_pos.raw"]);

    let again = manager.download(&sink).unwrap();
    assert!(again.skipped);
    assert_eq!(again.value.already_present, 2);

    manager.reset(Some("raw_data_downloaded")).unwrap();
    let rerun = manager.download(&sink).unwrap();
    assert!(!rerun.skipped);
    assert_eq!(rerun.value.already_present, 2);
    assert_eq!(rerun.value.downloaded, 0);
}

#[test]
fn failed_downloads_stop_the_pipeline_without_setting_the_flag() {
    let (_dir, root) = tempdir();
    let archive = FakeArchive::study(&["S1_pos.raw", "S2_pos.raw"], &["S2_pos.raw"]);
    let mut manager = manager(&root, archive, Vec::new());
    let sink = Recorder::default();

    let err = manager.run_all(&sink).unwrap_err();
    assert_matches!(
        err,
        StudyError::PartialFailure { ref stage, failed: 1 } if stage == "download"
    );

    let state = manager.state();
    assert!(state.is_done(StepFlag::RemoteFilesDiscovered));
    assert!(!state.is_done(StepFlag::RawDataDownloaded));
    assert!(!persisted_flag(state.path(), StepFlag::RawDataDownloaded));
    assert!(state.config().store.download_errors_path().is_file());
    assert!(state.config().store.raw_data_dir().join("S1_pos.raw").is_file());
    assert!(!state.config().store.raw_data_dir().join("S2_pos.raw").exists());
}

#[test]
fn crawl_failure_leaves_a_placeholder_log() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), Vec::new());
    let sink = Recorder::default();

    let outcome = manager.discover(&sink).unwrap();

    assert!(outcome.value.crawl_failed);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.value.catalog.is_empty());
    assert!(!manager.state().is_done(StepFlag::RemoteFilesDiscovered));
    let log_path = manager.state().config().store.discovery_log_path();
    let log = fs::read_to_string(log_path.as_std_path()).unwrap();
    assert_eq!(log.trim(), FAILED_CRAWL_PLACEHOLDER);
}

#[test]
fn study_without_massive_id_reads_raw_data_from_the_bucket() {
    let (_dir, root) = tempdir();
    let config = write_config(&root, None);
    let bucket = FakeBucket::with(&[
        "kroeger/raw/S1_pos.raw",
        "kroeger/raw/S2_pos.raw",
        "kroeger/raw/README.txt",
        "kroeger/processed_20240101/S1_pos.corems/S1_pos.csv",
        "other/raw/X_pos.raw",
    ]);
    let mut manager = manager_for(&config, FakeArchive::default(), Vec::new(), bucket);
    let sink = Recorder::default();

    let discovered = manager.discover(&sink).unwrap();
    assert!(!discovered.value.crawl_failed);
    assert_eq!(discovered.value.preview, vec!["S1_pos.raw", "S2_pos.raw"]);
    assert_eq!(
        discovered.value.catalog[0].location_uri,
        "s3://metabolomics/kroeger/raw/S1_pos.raw"
    );

    let downloaded = manager.download(&sink).unwrap();
    assert_eq!(downloaded.failed, 0);
    assert_eq!(downloaded.value.downloaded, 2);
    let raw_dir = manager.state().config().store.raw_data_dir().to_path_buf();
    assert_eq!(
        fs::read_to_string(raw_dir.join("S2_pos.raw").as_std_path()).unwrap(),
        "object kroeger/raw/S2_pos.raw"
    );
    assert!(manager.state().is_done(StepFlag::RawDataDownloaded));
}

struct LostPage;

impl BiosampleSource for LostPage {
    fn biosamples_for_study(&self, _study_id: &str) -> Result<Vec<BiosampleRecord>, StudyError> {
        Err(StudyError::Http("biosample_set page 2: 503 Service Unavailable".to_string()))
    }
}

impl UrlChecker for LostPage {
    fn head_status(&self, _url: &str) -> Result<u16, StudyError> {
        Ok(200)
    }
}

#[test]
fn failing_biosample_page_aborts_without_a_cache() {
    let (_dir, root) = tempdir();
    let config = write_config(&root, Some("MSV000012345"));
    let state = WorkflowState::load(&config).unwrap();
    let mut manager = StudyManager::new(
        state,
        FakeArchive::default(),
        LostPage,
        NoDocker,
        IdleRunner,
        FakeBucket::default(),
        FakeSubmitter,
    )
    .with_retry_policy(RetryPolicy::immediate(0));
    let sink = Recorder::default();
    manager.create_structure(&sink).unwrap();

    assert_matches!(manager.fetch_biosamples(&sink), Err(StudyError::Http(_)));
    let cache = manager.state().config().store.biosample_attributes_path();
    assert!(!cache.exists());
    assert!(!manager.state().is_done(StepFlag::BiosampleAttributesFetched));
}

#[test]
fn failed_crawl_maps_to_an_empty_mapping() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), vec![biosample("nmdc:bsm-11-aaa", "S1 root")]);
    let sink = Recorder::default();
    manager.create_structure(&sink).unwrap();
    assert!(manager.discover(&sink).unwrap().value.crawl_failed);
    manager.fetch_biosamples(&sink).unwrap();

    let mapped = manager.map_biosamples(&sink).unwrap();

    assert_eq!(mapped.failed, 0);
    assert_eq!(mapped.value.summary.total_files, 0);
    assert_eq!(mapped.value.summary.total_biosamples, 1);
    assert_eq!(mapped.value.mapped_files, 0);
    assert!(mapped.value.mapping_path.is_file());
    assert!(!manager.state().is_done(StepFlag::BiosampleMappingCompleted));
}

#[test]
fn skipped_stages_report_what_earlier_runs_left_on_disk() {
    let (_dir, root) = tempdir();
    let config = config_with_flags(
        &root,
        &[
            StepFlag::WdlsGenerated,
            StepFlag::DataProcessed,
            StepFlag::MetadataPackagesSubmitted,
        ],
    );
    let mut manager = manager_for(&config, FakeArchive::default(), Vec::new(), FakeBucket::default());
    let sink = Recorder::default();
    let store = manager.state().config().store.clone();

    let descriptor = store
        .config_wdl_dir("rp_pos")
        .join("run_metaMS_lcms_metabolomics_rp_pos_batch1.json");
    fs::create_dir_all(store.config_wdl_dir("rp_pos").as_std_path()).unwrap();
    fs::write(
        descriptor.as_std_path(),
        json!({"lcmsMetabolomics.runMetaMSLCMSMetabolomics.file_paths": ["/raw/a_pos.raw", "/raw/b_pos.raw"]})
            .to_string(),
    )
    .unwrap();
    let processed = store.processed_data_dir().to_path_buf();
    fs::create_dir_all(processed.join("a_pos.corems").as_std_path()).unwrap();
    fs::create_dir_all(processed.join("b_pos.corems").as_std_path()).unwrap();

    let batches = manager.generate_batches(&sink).unwrap();
    assert!(batches.skipped);
    assert_eq!(batches.value.validated_descriptors, 1);
    assert_eq!(batches.value.summary.descriptors.len(), 1);
    assert_eq!(batches.value.summary.descriptors[0].configuration, "rp_pos");
    assert_eq!(batches.value.summary.descriptors[0].batch, 1);
    assert_eq!(batches.value.summary.descriptors[0].files, 2);

    let processed_outcome = manager.process(None, &sink).unwrap();
    assert!(processed_outcome.skipped);
    assert_eq!(
        processed_outcome.value.processed,
        vec![processed.join("a_pos.corems"), processed.join("b_pos.corems")]
    );

    let submitted = manager.submit(&sink).unwrap();
    assert!(submitted.skipped);
    assert!(submitted.value.submitted.is_empty());
}

#[test]
fn submission_report_is_reloaded_once_submitted() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), Vec::new());
    let sink = Recorder::default();
    let packages = manager.state().config().store.submission_packages_dir();
    fs::create_dir_all(packages.as_std_path()).unwrap();
    fs::write(
        packages.join("a_package.json").as_std_path(),
        json!({"data_object_set": []}).to_string(),
    )
    .unwrap();

    let first = manager.submit(&sink).unwrap();
    assert_eq!(first.failed, 0);
    assert!(manager.state().config().store.submission_report_path().is_file());

    let again = manager.submit(&sink).unwrap();
    assert!(again.skipped);
    assert_eq!(again.value.submitted.len(), 1);
    assert_eq!(again.value.submitted[0].response, "accepted");
    assert_eq!(again.value.submitted[0].package, first.value.submitted[0].package);
}

#[test]
fn missing_prerequisites_are_reported() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), Vec::new());
    let sink = Recorder::default();

    assert_matches!(manager.download(&sink), Err(StudyError::MissingInput(_)));
    assert_matches!(manager.fetch_biosamples(&sink), Err(StudyError::MissingInput(_)));
    assert_matches!(manager.process(None, &sink), Err(StudyError::MissingInput(_)));
    assert_matches!(manager.inspect(&sink), Err(StudyError::Container(_)));
    assert!(!manager.state().is_done(StepFlag::BiosampleAttributesFetched));
}

#[test]
fn reset_rejects_unknown_flags_and_persists_known_ones() {
    let (_dir, root) = tempdir();
    let archive = FakeArchive::study(&["S1_pos.raw"], &[]);
    let mut manager = manager(&root, archive, Vec::new());
    let sink = Recorder::default();
    manager.create_structure(&sink).unwrap();
    manager.discover(&sink).unwrap();

    assert_matches!(
        manager.reset(Some("remote_files_found")),
        Err(StudyError::Configuration(_))
    );
    assert!(manager.state().is_done(StepFlag::RemoteFilesDiscovered));

    let status = manager.reset(Some("remote_files_discovered")).unwrap();
    let discovered = status
        .flags
        .iter()
        .find(|flag| flag.name == "remote_files_discovered")
        .unwrap();
    assert!(!discovered.done);
    assert!(manager.state().is_done(StepFlag::StudyStructureCreated));

    let status = manager.reset(None).unwrap();
    assert!(status.flags.iter().all(|flag| !flag.done));
    assert!(!persisted_flag(manager.state().path(), StepFlag::StudyStructureCreated));
}

#[test]
fn upload_sends_the_processed_directory() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), Vec::new());
    let sink = Recorder::default();
    manager.create_structure(&sink).unwrap();

    assert_matches!(manager.upload(&sink), Err(StudyError::MissingInput(_)));

    let processed = manager.state().config().store.processed_data_dir().to_path_buf();
    fs::create_dir_all(processed.join("S1_pos.corems").as_std_path()).unwrap();
    fs::write(processed.join("S1_pos.corems/S1_pos.csv").as_std_path(), "mz,intensity\n").unwrap();

    let uploaded = manager.upload(&sink).unwrap();
    assert_eq!(uploaded.value.prefix, "kroeger/processed_20250101");
    assert_eq!(
        uploaded.value.target.as_deref(),
        Some("s3://metabolomics/kroeger/processed_20250101")
    );
    assert_eq!(uploaded.value.uploaded, 1);
    assert!(uploaded.value.failures.is_empty());
    assert!(manager.state().is_done(StepFlag::ProcessedDataUploadedToMinio));

    let again = manager.upload(&sink).unwrap();
    assert!(again.skipped);
    assert_eq!(again.value.target, None);

    manager.reset(Some("processed_data_uploaded_to_minio")).unwrap();
    let rerun = manager.upload(&sink).unwrap();
    assert_eq!(rerun.value.uploaded, 0);
    assert_eq!(rerun.value.unchanged, 1);
}

#[test]
fn rejected_packages_are_recorded_and_keep_the_flag_unset() {
    let (_dir, root) = tempdir();
    let mut manager = manager(&root, FakeArchive::default(), Vec::new());
    let sink = Recorder::default();

    assert_matches!(manager.submit(&sink), Err(StudyError::MissingInput(_)));

    let packages = manager.state().config().store.submission_packages_dir();
    fs::create_dir_all(packages.as_std_path()).unwrap();
    fs::write(
        packages.join("a_package.json").as_std_path(),
        json!({"data_object_set": []}).to_string(),
    )
    .unwrap();
    fs::write(packages.join("b_package.json").as_std_path(), "{}").unwrap();

    let outcome = manager.submit(&sink).unwrap();
    assert_eq!(outcome.value.submitted.len(), 1);
    assert_eq!(outcome.value.submitted[0].response, "accepted");
    assert_eq!(outcome.value.failures.len(), 1);
    assert!(outcome.value.failures[0].package.ends_with("b_package.json"));
    assert_eq!(outcome.failed, 1);
    assert!(!manager.state().is_done(StepFlag::MetadataPackagesSubmitted));
}
