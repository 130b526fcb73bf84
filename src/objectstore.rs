use std::fs;
use std::io::Write;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::ObjectStoreSettings;
use crate::download::RemoteFetcher;
use crate::error::StudyError;
use crate::retry::RetryPolicy;

pub const ACCESS_KEY_ENV: &str = "MINIO_ACCESS_KEY";
pub const SECRET_KEY_ENV: &str = "MINIO_SECRET_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Bucket-scoped object storage.
pub trait ObjectStore: Send + Sync {
    fn ensure_ready(&self) -> Result<(), StudyError>;
    /// Size of `key`, or `None` when the object does not exist.
    fn object_size(&self, key: &str) -> Result<Option<u64>, StudyError>;
    fn put_file(&self, path: &Utf8Path, key: &str) -> Result<(), StudyError>;
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StudyError>;
    fn fetch(&self, key: &str, destination: &mut dyn Write) -> Result<u64, StudyError>;
    /// `s3://<bucket>/<key>`
    fn location(&self, key: &str) -> String;
}

/// S3-compatible client for the MinIO deployment. Calls run on a private
/// current-thread runtime so the rest of the crate stays blocking.
pub struct S3ObjectStore {
    runtime: Runtime,
    client: Option<Client>,
    settings: ObjectStoreSettings,
}

impl S3ObjectStore {
    pub fn new(settings: ObjectStoreSettings) -> Result<Self, StudyError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| StudyError::ObjectStore(format!("start runtime: {err}")))?;
        let client = match (settings.endpoint.as_deref(), credentials_from_env()) {
            (Some(endpoint), Some(credentials)) => Some(build_client(&settings, endpoint, credentials)),
            _ => None,
        };
        Ok(Self {
            runtime,
            client,
            settings,
        })
    }

    fn client(&self) -> Result<&Client, StudyError> {
        if self.settings.endpoint.is_none() {
            return Err(StudyError::Configuration(
                "minio.endpoint is required for object storage".to_string(),
            ));
        }
        self.client.as_ref().ok_or_else(|| {
            StudyError::MissingCredential(format!("{ACCESS_KEY_ENV} and {SECRET_KEY_ENV}"))
        })
    }

    fn bucket(&self) -> &str {
        &self.settings.bucket
    }
}

fn credentials_from_env() -> Option<Credentials> {
    let access = std::env::var(ACCESS_KEY_ENV).ok()?;
    let secret = std::env::var(SECRET_KEY_ENV).ok()?;
    Some(Credentials::new(access, secret, None, None, "nmdc-study-manager"))
}

fn build_client(settings: &ObjectStoreSettings, endpoint: &str, credentials: Credentials) -> Client {
    let config = aws_sdk_s3::Config::builder()
        .credentials_provider(credentials)
        .region(Region::new(settings.region.clone()))
        .force_path_style(true)
        .endpoint_url(endpoint_url(endpoint, settings.secure))
        .build();
    Client::from_conf(config)
}

/// `host:port` gets a scheme from `secure`; explicit schemes are kept.
pub fn endpoint_url(endpoint: &str, secure: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{endpoint}")
}

fn s3_error(action: &str, key: &str, err: impl std::error::Error) -> StudyError {
    StudyError::ObjectStore(format!("{action} {key}: {}", DisplayErrorContext(err)))
}

impl ObjectStore for S3ObjectStore {
    fn ensure_ready(&self) -> Result<(), StudyError> {
        let client = self.client()?;
        self.runtime
            .block_on(client.head_bucket().bucket(self.bucket()).send())
            .map_err(|err| s3_error("head bucket", self.bucket(), err))?;
        debug!(bucket = self.bucket(), "object storage reachable");
        Ok(())
    }

    fn object_size(&self, key: &str) -> Result<Option<u64>, StudyError> {
        let client = self.client()?;
        let response = self
            .runtime
            .block_on(client.head_object().bucket(self.bucket()).key(key).send());
        match response {
            Ok(head) => Ok(Some(
                head.content_length()
                    .and_then(|size| u64::try_from(size).ok())
                    .unwrap_or(0),
            )),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found()) =>
            {
                Ok(None)
            }
            Err(err) => Err(s3_error("head", key, err)),
        }
    }

    fn put_file(&self, path: &Utf8Path, key: &str) -> Result<(), StudyError> {
        let client = self.client()?;
        self.runtime.block_on(async {
            let body = ByteStream::from_path(path.as_std_path())
                .await
                .map_err(|err| StudyError::Filesystem(format!("read {path}: {err}")))?;
            client
                .put_object()
                .bucket(self.bucket())
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|err| s3_error("put", key, err))?;
            Ok::<_, StudyError>(())
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StudyError> {
        let client = self.client()?;
        self.runtime.block_on(async {
            let mut objects = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let response = client
                    .list_objects_v2()
                    .bucket(self.bucket())
                    .prefix(prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(|err| s3_error("list", prefix, err))?;
                for object in response.contents() {
                    let Some(key) = object.key() else {
                        continue;
                    };
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        size: object.size().and_then(|size| u64::try_from(size).ok()).unwrap_or(0),
                    });
                }
                match response.next_continuation_token() {
                    Some(next) if response.is_truncated().unwrap_or(false) => {
                        token = Some(next.to_string());
                    }
                    _ => break,
                }
            }
            Ok::<_, StudyError>(objects)
        })
    }

    fn fetch(&self, key: &str, destination: &mut dyn Write) -> Result<u64, StudyError> {
        let client = self.client()?;
        self.runtime.block_on(async {
            let response = client
                .get_object()
                .bucket(self.bucket())
                .key(key)
                .send()
                .await
                .map_err(|err| s3_error("get", key, err))?;
            let mut body = response.body;
            let mut written = 0u64;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|err| s3_error("read", key, err))?
            {
                destination.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            Ok::<_, StudyError>(written)
        })
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket(), key.trim_start_matches('/'))
    }
}

/// Key part of an `s3://<bucket>/<key>` location; other strings are taken as keys.
pub fn object_key(location: &str) -> &str {
    match location.strip_prefix("s3://") {
        Some(rest) => rest.split_once('/').map_or("", |(_, key)| key),
        None => location,
    }
}

/// Serves catalog downloads from the object store.
pub struct ObjectFetcher<'a, O: ?Sized> {
    store: &'a O,
}

impl<'a, O: ObjectStore + ?Sized> ObjectFetcher<'a, O> {
    pub fn new(store: &'a O) -> Self {
        Self { store }
    }
}

impl<O: ObjectStore + ?Sized> RemoteFetcher for ObjectFetcher<'_, O> {
    fn fetch(&mut self, location_uri: &str, destination: &mut dyn Write) -> Result<u64, StudyError> {
        self.store.fetch(object_key(location_uri), destination)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub file: Utf8PathBuf,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub target: String,
    pub uploaded: Vec<String>,
    /// Files whose object already exists with the same size.
    pub unchanged: usize,
    pub failures: Vec<UploadFailure>,
}

/// Uploads every file under `local_dir` to `<prefix>/<relative path>`.
/// One failing file never stops the loop.
pub fn upload_dir<O: ObjectStore + ?Sized>(
    store: &O,
    local_dir: &Utf8Path,
    prefix: &str,
    policy: RetryPolicy,
) -> Result<UploadReport, StudyError> {
    let prefix = prefix.trim_matches('/');
    let mut report = UploadReport {
        target: store.location(prefix),
        ..UploadReport::default()
    };
    let files = files_under(local_dir)?;
    info!(files = files.len(), source = %local_dir, target = %report.target, "uploading to object storage");

    for (idx, file) in files.iter().enumerate() {
        let relative = file.strip_prefix(local_dir).unwrap_or(file);
        let key = format!("{prefix}/{}", relative.as_str().replace('\\', "/"));
        match upload_one(store, file, &key, policy) {
            Ok(true) => {
                debug!(key = %key, progress = %format!("{}/{}", idx + 1, files.len()), "uploaded");
                report.uploaded.push(key);
            }
            Ok(false) => report.unchanged += 1,
            Err(err) => {
                warn!(file = %file, error = %err, "upload failed");
                report.failures.push(UploadFailure {
                    file: file.clone(),
                    key,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        uploaded = report.uploaded.len(),
        unchanged = report.unchanged,
        failed = report.failures.len(),
        "upload finished"
    );
    Ok(report)
}

/// `false` when the remote copy already has the local size.
fn upload_one<O: ObjectStore + ?Sized>(
    store: &O,
    file: &Utf8Path,
    key: &str,
    policy: RetryPolicy,
) -> Result<bool, StudyError> {
    let local_size = fs::metadata(file.as_std_path())?.len();
    if policy.run(key, |_| store.object_size(key))? == Some(local_size) {
        return Ok(false);
    }
    policy.run(key, |_| store.put_file(file, key))?;
    Ok(true)
}

fn files_under(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StudyError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(current.as_std_path())
            .map_err(|err| StudyError::Filesystem(format!("read {current}: {err}")))?;
        for entry in entries.flatten() {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryBucket {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        broken_keys: HashSet<String>,
        puts: Mutex<usize>,
    }

    impl ObjectStore for MemoryBucket {
        fn ensure_ready(&self) -> Result<(), StudyError> {
            Ok(())
        }

        fn object_size(&self, key: &str) -> Result<Option<u64>, StudyError> {
            let objects = self.objects.lock().unwrap();
            Ok(objects.get(key).map(|body| body.len() as u64))
        }

        fn put_file(&self, path: &Utf8Path, key: &str) -> Result<(), StudyError> {
            if self.broken_keys.contains(key) {
                return Err(StudyError::ObjectStore(format!("put {key}: AccessDenied")));
            }
            *self.puts.lock().unwrap() += 1;
            let body = fs::read(path.as_std_path())?;
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StudyError> {
            let objects = self.objects.lock().unwrap();
            Ok(objects
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

    fn processed_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("processed_20250101")).unwrap();
        fs::create_dir_all(dir.join("S1_pos.corems").as_std_path()).unwrap();
        fs::write(dir.join("S1_pos.corems/S1_pos.csv").as_std_path(), "mz,intensity\n").unwrap();
        fs::write(dir.join("S2_pos.csv").as_std_path(), "mz\n").unwrap();
        (temp, dir)
    }

    #[test]
    fn upload_skips_objects_with_the_same_size() {
        let (_temp, dir) = processed_dir();
        let bucket = MemoryBucket::default();
        bucket
            .objects
            .lock()
            .unwrap()
            .insert("kroeger/processed_20250101/S2_pos.csv".to_string(), b"mz\n".to_vec());

        let report = upload_dir(&bucket, &dir, "/kroeger/processed_20250101/", RetryPolicy::immediate(0)).unwrap();

        assert_eq!(report.target, "s3://metabolomics/kroeger/processed_20250101");
        assert_eq!(
            report.uploaded,
            vec!["kroeger/processed_20250101/S1_pos.corems/S1_pos.csv".to_string()]
        );
        assert_eq!(report.unchanged, 1);
        assert_eq!(*bucket.puts.lock().unwrap(), 1);

        let again = upload_dir(&bucket, &dir, "kroeger/processed_20250101", RetryPolicy::immediate(0)).unwrap();
        assert!(again.uploaded.is_empty());
        assert_eq!(again.unchanged, 2);
    }

    #[test]
    fn upload_counts_failed_files_and_keeps_going() {
        let (_temp, dir) = processed_dir();
        let bucket = MemoryBucket {
            broken_keys: HashSet::from(["kroeger/processed_20250101/S1_pos.corems/S1_pos.csv".to_string()]),
            ..MemoryBucket::default()
        };

        let report = upload_dir(&bucket, &dir, "kroeger/processed_20250101", RetryPolicy::immediate(1)).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, dir.join("S1_pos.corems/S1_pos.csv"));
        assert!(report.failures[0].error.contains("AccessDenied"));
        assert_eq!(report.uploaded, vec!["kroeger/processed_20250101/S2_pos.csv".to_string()]);
    }

    #[test]
    fn object_fetcher_resolves_s3_locations() {
        let bucket = MemoryBucket::default();
        bucket
            .objects
            .lock()
            .unwrap()
            .insert("kroeger/raw/S1_pos.raw".to_string(), b"RAW".to_vec());
        let mut fetcher = ObjectFetcher::new(&bucket);
        let mut body = Vec::new();

        let size = fetcher
            .fetch("s3://metabolomics/kroeger/raw/S1_pos.raw", &mut body)
            .unwrap();

        assert_eq!(size, 3);
        assert_eq!(body, b"RAW");
        assert_eq!(object_key("kroeger/raw/S1_pos.raw"), "kroeger/raw/S1_pos.raw");
    }

    #[test]
    fn endpoint_scheme_follows_secure_flag() {
        assert_eq!(endpoint_url("minio.example.org:9000", false), "http://minio.example.org:9000");
        assert_eq!(endpoint_url("minio.example.org:9000/", true), "https://minio.example.org:9000");
        assert_eq!(endpoint_url("http://localhost:9000", true), "http://localhost:9000");
    }
}
