use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::num::NonZeroUsize;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use nmdc_study_manager::batch::{
    BatchPlanner, descriptor_file_name, existing_descriptors, validate_descriptors,
    write_runner_script,
};
use nmdc_study_manager::config::ConfigurationEntry;
use nmdc_study_manager::domain::{MatchConfidence, RawFileType, WorkflowType};
use nmdc_study_manager::error::StudyError;
use nmdc_study_manager::mapping::MappedFile;
use nmdc_study_manager::store::Store;

fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn touch(path: &Utf8Path) {
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    fs::write(path.as_std_path(), b"x").unwrap();
}

fn sample(store: &Store, name: &str) -> MappedFile {
    let path = store.raw_data_dir().join(name);
    touch(&path);
    MappedFile {
        raw_file_path: path,
        raw_file_type: RawFileType::Sample,
        biosample_id: Some(format!("nmdc:bsm-{name}")),
        biosample_name: Some(name.to_string()),
        match_confidence: MatchConfidence::High,
    }
}

#[test]
fn validation_reports_every_missing_reference() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let wdl_jsons = root.join("wdl_jsons");
    let present = root.join("raw/present.raw");
    touch(&present);

    let prefix = "lcmsMetabolomics.runMetaMSLCMSMetabolomics";
    let first = json!({
        format!("{prefix}.file_paths"): [present.as_str(), "/nope/b.raw", "/nope/a.raw"],
        format!("{prefix}.corems_toml_path"): "/nope/corems.toml",
        format!("{prefix}.output_directory"): "output",
    });
    let second = json!({
        format!("{prefix}.file_paths"): ["/nope/a.raw"],
        format!("{prefix}.msp_file_path"): present.as_str(),
    });
    fs::create_dir_all(wdl_jsons.join("rp_pos").as_std_path()).unwrap();
    fs::write(wdl_jsons.join("rp_pos/run_1.json").as_std_path(), first.to_string()).unwrap();
    fs::write(wdl_jsons.join("rp_pos/run_2.json").as_std_path(), second.to_string()).unwrap();
    fs::write(wdl_jsons.join("rp_pos/run_3.json").as_std_path(), "{ truncated").unwrap();

    let missing = match validate_descriptors(&wdl_jsons) {
        Err(StudyError::MissingReferences { missing }) => missing,
        other => panic!("expected missing references, got {other:?}"),
    };
    assert_eq!(missing.len(), 4);
    assert!(missing[0].contains("run_3.json"));
    assert_eq!(&missing[1..], ["/nope/a.raw", "/nope/b.raw", "/nope/corems.toml"]);
}

#[test]
fn planner_writes_valid_lcms_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "kroeger_lcms", "kroeger", None);
    store.create_structure(&["rp_pos"]).unwrap();

    let params = root.join("params");
    for name in ["corems.toml", "metams.msp", "scan_translator.toml"] {
        touch(&params.join(name));
    }
    let configurations: Vec<ConfigurationEntry> = serde_json::from_value(json!([{
        "name": "rp_pos",
        "file_filter": ["pos"],
        "corems_toml": params.join("corems.toml"),
        "reference_db": params.join("metams.msp"),
        "scan_translator": params.join("scan_translator.toml"),
        "cores": 2
    }]))
    .unwrap();

    let files: Vec<MappedFile> = ["s1_pos.raw", "s2_pos.raw", "s3_pos.raw", "s4_pos.raw", "bad_pos.raw"]
        .iter()
        .map(|name| sample(&store, name))
        .collect();
    touch(&store.processed_data_dir().join("s4_pos.corems/s4_pos.csv"));
    let problem_files = BTreeSet::from(["bad_pos.raw".to_string()]);
    let write_times = HashMap::new();

    let planner = BatchPlanner {
        workflow_type: WorkflowType::LcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(2).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };
    let summary = planner.generate(&files, &configurations).unwrap();

    assert_eq!(summary.problem_files_excluded, 1);
    assert_eq!(summary.already_processed, 1);
    assert_eq!(summary.descriptors.len(), 2);
    assert_eq!(summary.descriptors[0].files, 2);
    assert_eq!(summary.descriptors[1].files, 1);
    assert_eq!(
        summary.descriptors[1].path,
        store.config_wdl_dir("rp_pos").join(descriptor_file_name(
            WorkflowType::LcmsMetabolomics,
            "rp_pos",
            2
        ))
    );

    let content = fs::read_to_string(summary.descriptors[0].path.as_std_path()).unwrap();
    let document: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(
        document["lcmsMetabolomics.runMetaMSLCMSMetabolomics.file_paths"],
        json!([
            store.raw_data_dir().join("s1_pos.raw").as_str(),
            store.raw_data_dir().join("s2_pos.raw").as_str()
        ])
    );
    assert_eq!(document["lcmsMetabolomics.runMetaMSLCMSMetabolomics.cores"], json!(2));

    assert_eq!(validate_descriptors(&store.wdl_jsons_dir()).unwrap(), 2);

    let rerun = planner.generate(&files[..1], &configurations).unwrap();
    assert_eq!(rerun.descriptors.len(), 1, "stale descriptors are replaced");
    assert_eq!(validate_descriptors(&store.wdl_jsons_dir()).unwrap(), 1);
}

#[test]
fn gcms_planning_needs_a_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "gc", "gc_study", None);
    let toml = root.join("params/corems.toml");
    touch(&toml);
    let configurations: Vec<ConfigurationEntry> =
        serde_json::from_value(json!([{"name": "gcms", "corems_toml": toml}])).unwrap();
    let files = vec![sample(&store, "s1.cdf")];
    let problem_files = BTreeSet::new();
    let write_times = HashMap::new();

    let planner = BatchPlanner {
        workflow_type: WorkflowType::GcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(10).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };
    assert_matches!(
        planner.generate(&files, &configurations),
        Err(StudyError::MissingInput(_))
    );
}

fn lcms_configurations(params: &Utf8Path, names: &[(&str, &str)]) -> Vec<ConfigurationEntry> {
    for name in ["corems.toml", "metams.msp", "scan_translator.toml"] {
        touch(&params.join(name));
    }
    let entries: Vec<Value> = names
        .iter()
        .map(|(name, filter)| {
            json!({
                "name": name,
                "file_filter": [filter],
                "corems_toml": params.join("corems.toml"),
                "reference_db": params.join("metams.msp"),
                "scan_translator": params.join("scan_translator.toml")
            })
        })
        .collect();
    serde_json::from_value(Value::Array(entries)).unwrap()
}

#[test]
fn rerun_drops_descriptors_of_a_fully_processed_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "kroeger_lcms", "kroeger", None);
    store.create_structure(&["rp_pos", "rp_neg"]).unwrap();
    let configurations = lcms_configurations(&root.join("params"), &[("rp_pos", "pos"), ("rp_neg", "neg")]);
    let files = vec![sample(&store, "a_pos.raw"), sample(&store, "b_neg.raw")];
    let problem_files = BTreeSet::new();
    let write_times = HashMap::new();
    let planner = BatchPlanner {
        workflow_type: WorkflowType::LcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(10).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };

    let first = planner.generate(&files, &configurations).unwrap();
    assert_eq!(first.descriptors.len(), 2);

    touch(&store.processed_data_dir().join("b_neg.corems/b_neg.csv"));
    let rerun = planner.generate(&files, &configurations).unwrap();

    assert_eq!(rerun.already_processed, 1);
    assert_eq!(rerun.descriptors.len(), 1);
    assert_eq!(rerun.descriptors[0].configuration, "rp_pos");
    assert_eq!(validate_descriptors(&store.wdl_jsons_dir()).unwrap(), rerun.descriptors.len());
    assert!(!store.config_wdl_dir("rp_neg").exists());
}

#[test]
fn planning_fails_when_no_configuration_matches() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "kroeger_lcms", "kroeger", None);
    let configurations = lcms_configurations(&root.join("params"), &[("hilic_pos", "hilic")]);
    let files = vec![sample(&store, "a_rp_pos.raw"), sample(&store, "b_rp_neg.raw")];
    let problem_files = BTreeSet::new();
    let write_times = HashMap::new();
    let planner = BatchPlanner {
        workflow_type: WorkflowType::LcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(10).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };

    assert_matches!(
        planner.generate(&files, &configurations),
        Err(StudyError::MissingInput(message)) if message.contains("no configuration matched")
    );
    assert!(existing_descriptors(&store.wdl_jsons_dir()).unwrap().is_empty());
}

#[test]
fn processed_calibrations_still_anchor_gcms_batches() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "gc", "gc_study", None);
    let toml = root.join("params/corems.toml");
    touch(&toml);
    let configurations: Vec<ConfigurationEntry> =
        serde_json::from_value(json!([{"name": "gcms", "corems_toml": toml}])).unwrap();
    let calibration = MappedFile {
        raw_file_type: RawFileType::Calibration,
        biosample_id: None,
        ..sample(&store, "fames_cal.cdf")
    };
    let files = vec![calibration, sample(&store, "s1.cdf")];
    touch(&store.processed_data_dir().join("fames_cal.csv"));
    let problem_files = BTreeSet::new();
    let write_times = HashMap::new();
    let planner = BatchPlanner {
        workflow_type: WorkflowType::GcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(10).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };

    let summary = planner.generate(&files, &configurations).unwrap();

    assert_eq!(summary.already_processed, 0);
    assert_eq!(summary.descriptors.len(), 1);
    let content = fs::read_to_string(summary.descriptors[0].path.as_std_path()).unwrap();
    assert!(content.contains(store.raw_data_dir().join("fames_cal.cdf").as_str()));
}

#[test]
fn existing_descriptors_are_read_back_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let store = Store::new(&root.join("work"), &root.join("data"), "kroeger_lcms", "kroeger", None);
    let configurations = lcms_configurations(&root.join("params"), &[("rp_pos", "pos")]);
    let files: Vec<MappedFile> = ["s1_pos.raw", "s2_pos.raw", "s3_pos.raw"]
        .iter()
        .map(|name| sample(&store, name))
        .collect();
    let problem_files = BTreeSet::new();
    let write_times = HashMap::new();
    let planner = BatchPlanner {
        workflow_type: WorkflowType::LcmsMetabolomics,
        store: &store,
        batch_size: NonZeroUsize::new(2).unwrap(),
        problem_files: &problem_files,
        write_times: &write_times,
    };
    let written = planner.generate(&files, &configurations).unwrap();

    let reloaded = existing_descriptors(&store.wdl_jsons_dir()).unwrap();

    assert_eq!(reloaded.len(), written.descriptors.len());
    for (read, made) in reloaded.iter().zip(&written.descriptors) {
        assert_eq!(read.configuration, made.configuration);
        assert_eq!(read.batch, made.batch);
        assert_eq!(read.files, made.files);
        assert_eq!(read.path, made.path);
    }
}

#[test]
fn runner_script_loops_over_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let root = root(&dir);
    let script = root.join("scripts/kroeger_lcms_wdl_runner.sh");
    fs::create_dir_all(root.join("scripts").as_std_path()).unwrap();

    write_runner_script(
        &script,
        &root.join("wdl_jsons"),
        WorkflowType::LcmsLipidomics,
        "kroeger",
        "nmdc:sty-11-dwsv7q78",
    )
    .unwrap();

    let content = fs::read_to_string(script.as_std_path()).unwrap();
    assert!(content.starts_with("#!/usr/bin/env bash"));
    assert!(content.contains("--verbose --no-cache --copy-input-files"));
    assert!(content.contains(root.join("wdl_jsons").as_str()));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(script.as_std_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
