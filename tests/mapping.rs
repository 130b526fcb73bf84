use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use nmdc_study_manager::domain::{
    ControlKind, MappingAssignment, MatchConfidence, MatchLevel, MatchOutcome, RawFileType,
};
use nmdc_study_manager::error::StudyError;
use nmdc_study_manager::mapping::{mapped_files, read_mapping, write_mapping};

fn matched(file: &str, id: &str, level: MatchLevel) -> MappingAssignment {
    MappingAssignment {
        raw_file_name: file.to_string(),
        outcome: MatchOutcome::Matched {
            biosample_id: id.to_string(),
            biosample_name: format!("{id} name"),
            level,
        },
    }
}

fn assignments() -> Vec<MappingAssignment> {
    vec![
        matched("S1_pos.raw", "nmdc:bsm-1", MatchLevel::High),
        matched("S2_pos.raw", "nmdc:bsm-2", MatchLevel::Medium),
        matched("S3_pos.raw", "nmdc:bsm-3", MatchLevel::Low),
        MappingAssignment {
            raw_file_name: "S4_pos.raw".to_string(),
            outcome: MatchOutcome::Ambiguous { candidates: 0 },
        },
        MappingAssignment {
            raw_file_name: "blank_01.raw".to_string(),
            outcome: MatchOutcome::Control {
                kind: ControlKind::Control,
            },
        },
        MappingAssignment {
            raw_file_name: "FAMES_01.raw".to_string(),
            outcome: MatchOutcome::Control {
                kind: ControlKind::Calibration,
            },
        },
        MappingAssignment {
            raw_file_name: "mystery.raw".to_string(),
            outcome: MatchOutcome::Unmatched,
        },
    ]
}

#[test]
fn written_mapping_reloads_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("mapping.csv")).unwrap();

    write_mapping(&path, &assignments()).unwrap();

    assert_eq!(read_mapping(&path).unwrap(), assignments());
}

#[test]
fn hand_edited_rows_are_all_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("mapping.csv")).unwrap();
    fs::write(
        path.as_std_path(),
        "raw_file_name,raw_file_type,biosample_id,biosample_name,match_confidence\n\
         a.raw,sample,nmdc:bsm-1,A,great\n\
         b.raw,sample,,,high\n\
         c.raw,control,nmdc:bsm-3,C,high\n\
         d.raw,sample,nmdc:bsm-4,D,no_match\n\
         e.raw,sample,nmdc:bsm-5,E,medium\n",
    )
    .unwrap();

    let err = read_mapping(&path).unwrap_err();
    assert_matches!(&err, StudyError::InvalidMapping { problems, .. } if problems.len() == 4);
    let message = err.to_string();
    assert!(message.contains("line 2"));
    assert!(message.contains("line 5"));
    assert!(!message.contains("line 6"));
}

#[test]
fn mapped_files_keep_confident_samples_and_controls() {
    let raw_dir = Utf8PathBuf::from("/data/kroeger/raw");
    let mapped = mapped_files(&assignments(), &raw_dir);

    let names: Vec<&str> = mapped.iter().map(|file| file.file_name()).collect();
    assert_eq!(
        names,
        vec!["S1_pos.raw", "S2_pos.raw", "blank_01.raw", "FAMES_01.raw"]
    );
    assert_eq!(mapped[0].raw_file_path, raw_dir.join("S1_pos.raw"));
    assert_eq!(mapped[0].match_confidence, MatchConfidence::High);
    assert_eq!(mapped[3].raw_file_type, RawFileType::Calibration);
    assert_eq!(mapped[3].biosample_id, None);
}
