use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::error::StudyError;

const DOCKER_FALLBACKS: &[&str] = &[
    "/usr/local/bin/docker",
    "/usr/bin/docker",
    "/opt/homebrew/bin/docker",
];
const DOCKER_PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub docker: Option<String>,
    pub miniwdl: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// External executables the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct SystemTools {
    docker: Option<PathBuf>,
    miniwdl: Option<PathBuf>,
}

impl Default for SystemTools {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTools {
    pub fn new() -> Self {
        Self {
            docker: find_docker(),
            miniwdl: find_in_path("miniwdl"),
        }
    }

    pub fn docker_path(&self) -> Result<&Path, StudyError> {
        self.docker.as_deref().ok_or_else(|| {
            StudyError::Container(
                "docker was not found on PATH or in the usual install locations".to_string(),
            )
        })
    }

    /// Docker binary that answers `docker --version` in time.
    pub fn require_docker(&self) -> Result<&Path, StudyError> {
        let docker = self.docker_path()?;
        let output = run_with_timeout(
            docker,
            &["--version".to_string()],
            None,
            DOCKER_PRECHECK_TIMEOUT,
            "docker",
        )
        .map_err(|err| StudyError::Container(err.to_string()))?;
        debug!(version = %output.stdout.trim(), "docker is available");
        Ok(docker)
    }

    pub fn require_miniwdl(&self) -> Result<&Path, StudyError> {
        self.miniwdl
            .as_deref()
            .ok_or_else(|| StudyError::MissingTool("miniwdl".to_string()))
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            docker: self
                .docker
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
            miniwdl: self
                .miniwdl
                .as_ref()
                .and_then(|path| tool_version(path, &["--version"])),
        }
    }
}

/// Runs `program` to completion, killing it once `timeout` elapses.
pub fn run_with_timeout(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
    tool: &str,
) -> Result<CommandOutput, StudyError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let mut child = cmd.spawn().map_err(|err| StudyError::ToolFailed {
        tool: tool.to_string(),
        message: err.to_string(),
    })?;

    // Pipes are drained while polling; a full pipe would stall the child.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StudyError::Timeout(format!(
                    "{tool} after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                return Err(StudyError::ToolFailed {
                    tool: tool.to_string(),
                    message: err.to_string(),
                });
            }
        }
    };

    let output = CommandOutput {
        stdout: stdout.map(join_drain).unwrap_or_default(),
        stderr: stderr.map(join_drain).unwrap_or_default(),
    };
    if status.success() {
        return Ok(output);
    }
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        format!("command failed: {} ({status})", program.display())
    } else {
        stderr.to_string()
    };
    Err(StudyError::ToolFailed {
        tool: tool.to_string(),
        message,
    })
}

/// Runs `program` with inherited stdio so its progress reaches the terminal.
pub fn run_inherited(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    tool: &str,
) -> Result<(), StudyError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let status = cmd.status().map_err(|err| StudyError::ToolFailed {
        tool: tool.to_string(),
        message: err.to_string(),
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(StudyError::ToolFailed {
            tool: tool.to_string(),
            message: format!("exited with {status}"),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn find_docker() -> Option<PathBuf> {
    find_in_path("docker").or_else(|| {
        DOCKER_FALLBACKS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    })
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    stdout.lines().next().map(str::to_string).filter(|line| !line.is_empty())
}
