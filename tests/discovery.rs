use std::collections::HashMap;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use nmdc_study_manager::discovery::{
    Crawler, DiscoveryLog, FAILED_CRAWL_PLACEHOLDER, RemoteDirectory, RemoteEntry,
    parse_and_filter, preview, read_catalog, write_catalog,
};
use nmdc_study_manager::error::StudyError;

fn log(lines: &[&str]) -> DiscoveryLog {
    DiscoveryLog {
        lines: lines.iter().map(|line| line.to_string()).collect(),
    }
}

#[test]
fn keyword_filter_keeps_hilic_files_once() {
    let log = log(&[
        "# crawl of MSV000094090",
        "ftp://massive-ftp.ucsd.edu/MSV000094090/raw/S1_HILIC_pos.raw",
        "ftp://massive-ftp.ucsd.edu/MSV000094090/raw/S1_HILIC_pos.raw",
        "ftp://massive-ftp.ucsd.edu/MSV000094090/raw/S2_hilic_neg.RAW",
        "ftp://massive-ftp.ucsd.edu/MSV000094090/raw/S3_C18_pos.raw",
    ]);

    let catalog = parse_and_filter(&log, ".raw", &["HILIC".to_string()]);

    let names: Vec<&str> = catalog.iter().map(|entry| entry.short_name.as_str()).collect();
    assert_eq!(names, vec!["S1_HILIC_pos.raw", "S2_hilic_neg.RAW"]);
    assert_eq!(
        catalog[0].location_uri,
        "ftp://massive-ftp.ucsd.edu/MSV000094090/raw/S1_HILIC_pos.raw"
    );
}

#[test]
fn same_name_at_two_locations_keeps_the_first() {
    let log = log(&[
        "ftp://host/MSV1/a/sample.raw",
        "ftp://host/MSV1/b/sample.raw",
        "ftp://host/MSV1/b/notes.txt",
        "",
    ]);

    let catalog = parse_and_filter(&log, ".raw", &[]);

    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].location_uri, "ftp://host/MSV1/a/sample.raw");
}

#[test]
fn keywords_are_or_combined() {
    let log = log(&[
        "ftp://host/MSV1/x_pos.raw",
        "ftp://host/MSV1/x_neg.raw",
        "ftp://host/MSV1/x_qc.raw",
    ]);

    let catalog = parse_and_filter(&log, ".raw", &["POS".to_string(), "neg".to_string()]);

    assert_eq!(catalog.len(), 2);
    assert!(catalog.iter().all(|entry| !entry.short_name.contains("qc")));
}

#[test]
fn failed_crawl_yields_empty_catalog() {
    let catalog = parse_and_filter(&DiscoveryLog::failed(), ".raw", &[]);
    assert!(catalog.is_empty());
    assert_eq!(DiscoveryLog::failed().lines, vec![FAILED_CRAWL_PLACEHOLDER.to_string()]);
}

#[test]
fn catalog_reload_matches_written_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("massive_ftp_locs.csv")).unwrap();
    let catalog = parse_and_filter(
        &log(&["ftp://host/MSV1/a one.raw", "ftp://host/MSV1/b.raw"]),
        ".raw",
        &[],
    );

    write_catalog(&path, &catalog).unwrap();
    let reloaded = read_catalog(&path).unwrap();

    assert_eq!(reloaded, catalog);
    assert_eq!(preview(&reloaded), vec!["a one.raw", "b.raw"]);
}

struct Archive {
    dirs: HashMap<String, Vec<RemoteEntry>>,
}

impl Archive {
    fn entry(name: &str, is_directory: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            is_directory,
            size: None,
        }
    }
}

impl RemoteDirectory for Archive {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, StudyError> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| StudyError::Ftp(format!("550 {path}: no such directory")))
    }
}

#[test]
fn crawl_skips_unreadable_subdirectories() {
    let mut archive = Archive {
        dirs: HashMap::from([
            (
                "MSV1".to_string(),
                vec![
                    Archive::entry("raw", true),
                    Archive::entry("locked", true),
                    Archive::entry("README.txt", false),
                ],
            ),
            (
                "MSV1/raw".to_string(),
                vec![Archive::entry("S1.RAW", false), Archive::entry("S1.mzML", false)],
            ),
        ]),
    };

    let mut crawler = Crawler::new("ftp://massive-ftp.ucsd.edu", ".raw");
    let log = crawler.crawl(&mut archive, "/MSV1/").unwrap();

    assert_eq!(log.lines, vec!["ftp://massive-ftp.ucsd.edu/MSV1/raw/S1.RAW"]);
}

#[test]
fn crawl_reports_root_failure() {
    let mut archive = Archive {
        dirs: HashMap::new(),
    };
    let mut crawler = Crawler::new("ftp://massive-ftp.ucsd.edu", ".raw");
    assert_matches!(crawler.crawl(&mut archive, "MSV404"), Err(StudyError::Ftp(_)));
}
