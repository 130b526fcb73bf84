use std::io::{self, Write};
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, warn};

use crate::discovery::{RemoteDirectory, RemoteEntry};
use crate::download::RemoteFetcher;
use crate::error::StudyError;

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl FtpSettings {
    pub fn anonymous(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: format!("nmdc-sm/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn base_url(&self) -> String {
        format!("ftp://{}", self.host)
    }
}

/// Lazily connected FTP session shared by crawling and downloads.
pub struct FtpClient {
    settings: FtpSettings,
    stream: Option<FtpStream>,
}

impl FtpClient {
    pub fn new(settings: FtpSettings) -> Self {
        Self {
            settings,
            stream: None,
        }
    }

    pub fn settings(&self) -> &FtpSettings {
        &self.settings
    }

    fn session(&mut self) -> Result<&mut FtpStream, StudyError> {
        if self.stream.is_none() {
            let address = format!("{}:{}", self.settings.host, self.settings.port);
            debug!(%address, "connecting to FTP server");
            let mut stream = FtpStream::connect(&address).map_err(ftp_error)?;
            stream
                .get_ref()
                .set_read_timeout(Some(self.settings.timeout))
                .map_err(|err| StudyError::Ftp(err.to_string()))?;
            stream.set_mode(Mode::ExtendedPassive);
            stream
                .login(&self.settings.username, &self.settings.password)
                .map_err(ftp_error)?;
            stream
                .transfer_type(FileType::Binary)
                .map_err(ftp_error)?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| StudyError::Ftp("FTP session unavailable".to_string()))
    }

    /// Drops the session after connection-level failures so the next call reconnects.
    fn check<T>(&mut self, result: Result<T, FtpError>) -> Result<T, StudyError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(err, FtpError::ConnectionError(_)) {
                    self.stream = None;
                }
                Err(ftp_error(err))
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take()
            && let Err(err) = stream.quit()
        {
            warn!(error = %err, "failed to quit FTP session gracefully");
        }
    }

    fn remote_path(&self, location_uri: &str) -> Result<String, StudyError> {
        let without_scheme = location_uri
            .strip_prefix("ftp://")
            .ok_or_else(|| StudyError::Ftp(format!("not an ftp:// address: {location_uri}")))?;
        let (host, path) = without_scheme
            .split_once('/')
            .ok_or_else(|| StudyError::Ftp(format!("address has no path: {location_uri}")))?;
        if !host.eq_ignore_ascii_case(&self.settings.host) {
            return Err(StudyError::Ftp(format!(
                "address {location_uri} is not on {}",
                self.settings.host
            )));
        }
        Ok(format!("/{path}"))
    }
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl RemoteDirectory for FtpClient {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, StudyError> {
        let target = format!("/{}", path.trim_start_matches('/'));
        let result = self.session()?.list(Some(&target));
        let lines = self.check(result)?;
        Ok(lines.iter().filter_map(|line| RemoteEntry::parse(line)).collect())
    }
}

impl RemoteFetcher for FtpClient {
    fn fetch(&mut self, location_uri: &str, destination: &mut dyn Write) -> Result<u64, StudyError> {
        let path = self.remote_path(location_uri)?;
        let result = self.session()?.retr(&path, |reader| {
            io::copy(reader, &mut *destination).map_err(FtpError::ConnectionError)
        });
        self.check(result)
    }
}

fn ftp_error(err: FtpError) -> StudyError {
    StudyError::Ftp(err.to_string())
}
