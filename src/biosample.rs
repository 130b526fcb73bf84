use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::BiosampleRecord;
use crate::error::StudyError;
use crate::store;

#[derive(Debug, Serialize, Deserialize)]
struct BiosampleRow {
    id: String,
    name: String,
    #[serde(default)]
    samp_name: Option<String>,
    #[serde(default)]
    submitter_id: Option<String>,
    #[serde(default)]
    external_accessions: String,
}

pub fn write_biosample_cache(path: &Utf8Path, records: &[BiosampleRecord]) -> Result<(), StudyError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(BiosampleRow {
            id: record.id.clone(),
            name: record.name.clone(),
            samp_name: record.samp_name.clone(),
            submitter_id: record.submitter_id.clone(),
            external_accessions: record.external_accessions.join(";"),
        })?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| StudyError::Csv(err.to_string()))?;
    store::write_bytes_atomic(path, &content)
}

pub fn read_biosample_cache(path: &Utf8Path) -> Result<Vec<BiosampleRecord>, StudyError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())?;
    reader
        .deserialize::<BiosampleRow>()
        .map(|row| {
            let row = row?;
            Ok(BiosampleRecord {
                id: row.id,
                name: row.name,
                samp_name: row.samp_name.filter(|value| !value.is_empty()),
                submitter_id: row.submitter_id.filter(|value| !value.is_empty()),
                external_accessions: row
                    .external_accessions
                    .split(';')
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn cache_keeps_accessions() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("biosample_attributes.csv")).unwrap();
        let records = vec![BiosampleRecord {
            id: "nmdc:bsm-11-x".to_string(),
            name: "S1 root".to_string(),
            samp_name: None,
            submitter_id: Some("S1".to_string()),
            external_accessions: vec!["gold:Gb1".to_string(), "biosample:SAMN2".to_string()],
        }];
        write_biosample_cache(&path, &records).unwrap();
        assert_eq!(read_biosample_cache(&path).unwrap(), records);
    }
}
