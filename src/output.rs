use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{ProgressEvent, ProgressSink, RunSummary, StageOutcome, WorkflowStatus};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(status: &WorkflowStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    pub fn print_run(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_outcome<T: Serialize>(outcome: &StageOutcome<T>) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress narrative on the log stream plus colored summaries on stdout.
pub struct ConsoleOutput;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

impl ConsoleOutput {
    pub fn print_status(status: &WorkflowStatus) {
        println!("{CYAN}Study {} ({}){RESET}", status.study_name, status.study_id);
        println!("  workflow:   {}", status.workflow_name);
        if let Some(workflow_type) = &status.workflow_type {
            println!("  type:       {workflow_type}");
        }
        if let Some(massive_id) = &status.massive_id {
            println!("  massive id: {massive_id}");
        }
        println!("  config:     {}", status.config_path);
        println!("  root:       {}", status.workflow_root);
        println!("  raw data:   {}", status.raw_data_dir);
        println!("  processed:  {}", status.processed_data_dir);
        for flag in &status.flags {
            let (mark, color) = if flag.done { ("done", GREEN) } else { ("todo", YELLOW) };
            println!("{color}  [{mark}] {}{RESET}", flag.name);
        }
    }

    pub fn print_run(summary: &RunSummary) {
        println!("{CYAN}Pipeline summary{RESET}");
        for record in &summary.stages {
            Self::print_line(record.stage.as_str(), record.skipped, record.failed);
        }
    }

    pub fn print_outcome<T>(outcome: &StageOutcome<T>) {
        Self::print_line(outcome.stage.as_str(), outcome.skipped, outcome.failed);
    }

    fn print_line(stage: &str, skipped: bool, failed: usize) {
        if skipped {
            println!("{CYAN}  {stage}: skipped{RESET}");
        } else if failed > 0 {
            println!("{YELLOW}  {stage}: {failed} failed item(s){RESET}");
        } else {
            println!("{GREEN}  {stage}: done{RESET}");
        }
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed = ?elapsed, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
