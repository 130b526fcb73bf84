use miette::Diagnostic;
use thiserror::Error;

/// Error substrings that mark a failure as worth retrying.
pub const TRANSIENT_SIGNATURES: &[&str] = &[
    "file is locked",
    "sharing violation",
    "access denied",
    "permission denied",
    "device or resource busy",
    "file in use",
    "temporarily unavailable",
    "timed out",
    "connection reset",
];

#[derive(Debug, Error, Diagnostic)]
pub enum StudyError {
    #[error("configuration error: {0}")]
    #[diagnostic(help("check the study configuration JSON passed with --config"))]
    Configuration(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(String),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("NMDC request failed: {0}")]
    Http(String),

    #[error("NMDC returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("object storage error: {0}")]
    ObjectStore(String),

    #[error("required tool not found: {0}")]
    #[diagnostic(help("install it or make sure it is on PATH"))]
    MissingTool(String),

    #[error("container runtime unavailable: {0}")]
    #[diagnostic(help("start Docker Desktop or the docker daemon and retry"))]
    Container(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("invalid mapping file {path}: {}", .problems.join("; "))]
    #[diagnostic(help("fix the listed rows in the mapping CSV and re-run"))]
    InvalidMapping { path: String, problems: Vec<String> },

    #[error("{} batch descriptor reference(s) missing: {}", .missing.len(), .missing.join(", "))]
    #[diagnostic(help("create or fix the listed paths, then regenerate the batch descriptors"))]
    MissingReferences { missing: Vec<String> },

    #[error("prerequisite missing: {0}")]
    MissingInput(String),

    #[error("{stage} finished with {failed} failed item(s)")]
    PartialFailure { stage: String, failed: usize },
}

impl StudyError {
    /// Lock, busy and timeout conditions that clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            StudyError::Timeout(_) => true,
            StudyError::HttpStatus { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => {
                let text = self.to_string().to_lowercase();
                TRANSIENT_SIGNATURES
                    .iter()
                    .any(|signature| text.contains(signature))
            }
        }
    }
}

impl From<csv::Error> for StudyError {
    fn from(err: csv::Error) -> Self {
        StudyError::Csv(err.to_string())
    }
}

impl From<std::io::Error> for StudyError {
    fn from(err: std::io::Error) -> Self {
        StudyError::Filesystem(err.to_string())
    }
}
