use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use nmdc_study_manager::app::{ProgressSink, StageOutcome, StudyManager};
use nmdc_study_manager::domain::SubmitEnv;
use nmdc_study_manager::error::StudyError;
use nmdc_study_manager::ftp::{FtpClient, FtpSettings};
use nmdc_study_manager::inspect::DockerInspector;
use nmdc_study_manager::nmdc::NmdcHttpClient;
use nmdc_study_manager::objectstore::S3ObjectStore;
use nmdc_study_manager::output::{ConsoleOutput, JsonOutput, OutputMode};
use nmdc_study_manager::process::MiniwdlRunner;
use nmdc_study_manager::state::WorkflowState;
use nmdc_study_manager::tools::SystemTools;

const LOG_LEVEL_ENV: &str = "NMDC_LOG_LEVEL";
const LOG_FILE_ENV: &str = "NMDC_LOG_FILE";

#[derive(Parser)]
#[command(name = "nmdc-sm")]
#[command(about = "Resumable NMDC metabolomics study manager")]
#[command(version, author)]
struct Cli {
    /// Study configuration JSON; skip triggers are persisted back into it.
    #[arg(long, global = true, default_value = "study_config.json")]
    config: Utf8PathBuf,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every pipeline stage, skipping completed ones")]
    Run(SubmitArgs),
    #[command(about = "Show study paths and skip triggers")]
    Status,
    #[command(about = "Reset one skip trigger, or all of them")]
    Reset(ResetArgs),
    #[command(about = "Create the study directory structure")]
    Structure,
    #[command(about = "Crawl MassIVE and build the file catalog")]
    Discover,
    #[command(about = "Download cataloged raw files")]
    Download,
    #[command(about = "Fetch biosample attributes from the NMDC API")]
    Biosamples,
    #[command(about = "Match raw files to biosamples")]
    Map,
    #[command(about = "Inspect raw files with the containerised inspector")]
    Inspect,
    #[command(about = "Generate batch descriptors and the runner script")]
    Batches,
    #[command(about = "Check every path referenced by the batch descriptors")]
    Validate,
    #[command(about = "Run the WDL workflows and collect processed outputs")]
    Process(ProcessArgs),
    #[command(about = "Upload processed data to object storage")]
    Upload,
    #[command(about = "Generate metadata-generation input CSVs")]
    Metadata,
    #[command(about = "Validate and submit metadata packages")]
    Submit(SubmitArgs),
    #[command(about = "Show the external tools found on this machine")]
    Tools,
}

#[derive(Args)]
struct ResetArgs {
    /// Flag to clear; every flag when omitted.
    flag: Option<String>,
}

#[derive(Args)]
struct ProcessArgs {
    /// Directory miniwdl runs in; defaults to the study's wdl_execution directory.
    #[arg(long)]
    working_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(long, value_enum, default_value_t = SubmitEnv::Dev)]
    env: SubmitEnv,
}

type Manager =
    StudyManager<FtpClient, NmdcHttpClient, DockerInspector, MiniwdlRunner, S3ObjectStore, NmdcHttpClient>;

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<StudyError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StudyError) -> u8 {
    match error {
        StudyError::Configuration(_)
        | StudyError::ConfigRead(_)
        | StudyError::UnknownWorkflowType(_)
        | StudyError::MissingCredential(_) => 2,
        StudyError::Http(_)
        | StudyError::HttpStatus { .. }
        | StudyError::Ftp(_)
        | StudyError::ObjectStore(_)
        | StudyError::MissingTool(_)
        | StudyError::Container(_)
        | StudyError::ToolFailed { .. }
        | StudyError::Timeout(_)
        | StudyError::PartialFailure { .. } => 3,
        StudyError::InvalidMapping { .. } | StudyError::MissingReferences { .. } => 4,
        _ => 1,
    }
}

fn init_tracing() -> miette::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let file_layer = match std::env::var(LOG_FILE_ENV) {
        Ok(path) if !path.trim().is_empty() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.trim())
                .into_diagnostic()?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn run() -> miette::Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    if let Commands::Tools = cli.command {
        let info = SystemTools::new().tool_info();
        return match output_mode {
            OutputMode::NonInteractive => JsonOutput::print_json(&info).into_diagnostic(),
            OutputMode::Interactive => {
                let show = |path: &Option<String>| path.clone().unwrap_or_else(|| "not found".to_string());
                println!("docker:  {}", show(&info.docker));
                println!("miniwdl: {}", show(&info.miniwdl));
                Ok(())
            }
        };
    }

    let submit_env = match &cli.command {
        Commands::Run(args) | Commands::Submit(args) => args.env,
        _ => SubmitEnv::Dev,
    };
    let mut manager = build_manager(&cli.config, submit_env)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &ConsoleOutput,
        OutputMode::NonInteractive => &JsonOutput,
    };

    match cli.command {
        Commands::Run(_) => {
            let summary = manager.run_all(sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_run(&summary).into_diagnostic()?,
                OutputMode::Interactive => ConsoleOutput::print_run(&summary),
            }
        }
        Commands::Status => print_status(&manager, output_mode)?,
        Commands::Reset(args) => {
            manager.reset(args.flag.as_deref())?;
            print_status(&manager, output_mode)?;
        }
        Commands::Structure => report(output_mode, &manager.create_structure(sink)?)?,
        Commands::Discover => {
            let outcome = manager.discover(sink)?;
            if matches!(output_mode, OutputMode::Interactive) {
                println!("{} files in catalog", outcome.value.catalog.len());
                for name in &outcome.value.preview {
                    println!("  {name}");
                }
            }
            report(output_mode, &outcome)?;
        }
        Commands::Download => report(output_mode, &manager.download(sink)?)?,
        Commands::Biosamples => report(output_mode, &manager.fetch_biosamples(sink)?)?,
        Commands::Map => {
            let outcome = manager.map_biosamples(sink)?;
            if matches!(output_mode, OutputMode::Interactive) {
                let summary = &outcome.value.summary;
                println!(
                    "{} files: {} high, {} medium, {} low, {} multiple, {} unmatched, {} controls",
                    summary.total_files,
                    summary.high,
                    summary.medium,
                    summary.low,
                    summary.multiple_matches,
                    summary.unmatched,
                    summary.control_files
                );
                println!("biosample coverage: {:.1}%", summary.biosample_coverage_pct);
            }
            report(output_mode, &outcome)?;
        }
        Commands::Inspect => report(output_mode, &manager.inspect(sink)?)?,
        Commands::Batches => report(output_mode, &manager.generate_batches(sink)?)?,
        Commands::Validate => {
            let count = manager.validate_batches(sink)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_json(&serde_json::json!({ "valid_descriptors": count }))
                        .into_diagnostic()?
                }
                OutputMode::Interactive => println!("{count} batch descriptor(s) valid"),
            }
        }
        Commands::Process(args) => {
            report(output_mode, &manager.process(args.working_dir.as_deref(), sink)?)?
        }
        Commands::Upload => report(output_mode, &manager.upload(sink)?)?,
        Commands::Metadata => report(output_mode, &manager.generate_metadata_inputs(sink)?)?,
        Commands::Submit(_) => report(output_mode, &manager.submit(sink)?)?,
        Commands::Tools => {}
    }
    Ok(())
}

fn build_manager(config_path: &Utf8PathBuf, submit_env: SubmitEnv) -> miette::Result<Manager> {
    let state = WorkflowState::load(config_path)?;
    let config = state.config();
    let tools = SystemTools::new();
    let remote = FtpClient::new(FtpSettings::anonymous(&config.ftp_host));
    let nmdc = NmdcHttpClient::new(&config.api_base)?;
    let inspector = DockerInspector::new(tools.clone(), &config.inspector);
    let runner = MiniwdlRunner::new(tools);
    let object_store = S3ObjectStore::new(config.object_store.clone())?;
    let submitter = NmdcHttpClient::for_env(submit_env, &config.api_base)?;
    Ok(StudyManager::new(
        state,
        remote,
        nmdc,
        inspector,
        runner,
        object_store,
        submitter,
    ))
}

fn print_status(manager: &Manager, mode: OutputMode) -> miette::Result<()> {
    let status = manager.status();
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic(),
        OutputMode::Interactive => {
            ConsoleOutput::print_status(&status);
            Ok(())
        }
    }
}

fn report<T: Serialize>(mode: OutputMode, outcome: &StageOutcome<T>) -> miette::Result<()> {
    match mode {
        OutputMode::NonInteractive => JsonOutput::print_outcome(outcome).into_diagnostic(),
        OutputMode::Interactive => {
            ConsoleOutput::print_outcome(outcome);
            Ok(())
        }
    }
}
