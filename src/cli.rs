//
// cli.rs
// MedImg-Pipeline
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the pipeline stages.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::{
    analysis::AnalysisClient,
    config::PipelineConfig,
    decode, image,
    lifecycle::StudyLifecycle,
    models::ValidationVerdict,
    pipeline::{Pipeline, ProcessRequest},
    segmentation::SegmentationOrchestrator,
    storage::FileStore,
    validate::MedicalFileValidator,
    web,
};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "medimg")]
#[command(about = "Medical image validation, preview and segmentation pipeline", long_about = None)]
pub struct Cli {
    /// TOML configuration file layered over the built-in defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that a DICOM or NIFTI file is structurally sound
    Validate { file: PathBuf },
    /// Copy a file into the upload store and validate the stored copy
    Ingest { file: PathBuf },
    /// Decode a file and print its metadata and voxel statistics
    Info { file: PathBuf },
    /// Write a browser-viewable PNG of one slice
    Preview {
        file: PathBuf,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Slice index; out-of-range values are clamped, default is the middle slice
        #[arg(long, allow_hyphen_values = true)]
        slice: Option<i64>,
    },
    /// Write evenly spaced slices as PNG files
    Slices {
        file: PathBuf,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long)]
        count: Option<usize>,
    },
    /// Run the segmentation program (or its mock) on a file
    Segment {
        file: PathBuf,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long)]
        task: Option<String>,
    },
    /// Validate, decode, segment and analyze a file in one go
    Process {
        file: PathBuf,
        #[arg(short, long)]
        task: Option<String>,
        /// Specific question for the analysis stage
        #[arg(short, long)]
        request: Option<String>,
    },
    /// List the segmentation tasks the installed program supports
    Tasks,
    /// Send a test prompt to the text-generation API
    CheckApi,
    /// Start the web server
    Web {
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

pub async fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Validate { file } => {
            let validator = MedicalFileValidator::new(config.validation.max_file_bytes);
            let verdict = validator.validate(&file);
            print_json(&verdict)?;
            if let ValidationVerdict::Invalid { reason } = verdict {
                bail!("{} is not a valid medical image: {}", file.display(), reason);
            }
        }
        Commands::Ingest { file } => {
            let store = FileStore::new(&config.storage.upload_dir, config.storage.max_upload_bytes)?;
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let stored = store.save_reader(name.as_deref(), source).await?;
            // Rejected copies are removed from the store; the original stays untouched.
            let pipeline = Pipeline::from_config(&config).await?;
            let valid = pipeline.ingest(&stored.path)?;
            println!("Stored {} ({} bytes)", stored.path.display(), stored.size);
            print_json(&valid)?;
        }
        Commands::Info { file } => {
            let asset = decode::decode(&file)
                .with_context(|| format!("failed to decode {}", file.display()))?;
            print_json(&decode::describe(&asset))?;
        }
        Commands::Preview {
            file,
            output_dir,
            slice,
        } => {
            let asset = decode::decode(&file)
                .with_context(|| format!("failed to decode {}", file.display()))?;
            let dir = output_dir_or(&config, output_dir)?;
            let path = image::prepare_for_web(&asset, &dir, slice)?;
            println!("Preview written to {}", path.display());
        }
        Commands::Slices {
            file,
            output_dir,
            count,
        } => {
            let count = count.unwrap_or(config.display.slice_count);
            if count == 0 {
                bail!("Slice count must be greater than zero");
            }
            let asset = decode::decode(&file)
                .with_context(|| format!("failed to decode {}", file.display()))?;
            let dir = output_dir_or(&config, output_dir)?;
            let written = image::write_even_slices(&asset, &dir, count)?;
            println!("Wrote {} slice(s) to {}", written.len(), dir.display());
            for path in written {
                println!("  {}", path.display());
            }
        }
        Commands::Segment {
            file,
            output_dir,
            task,
        } => {
            let orchestrator = SegmentationOrchestrator::from_config(&config.segmentation).await;
            let dir = output_dir.unwrap_or_else(|| config.storage.processed_dir.clone());
            let task = task.unwrap_or_else(|| orchestrator.default_task().to_string());
            let outcome = orchestrator
                .segment(&file, &dir, &task)
                .await
                .with_context(|| format!("segmentation of {} failed", file.display()))?;
            print_json(&outcome)?;
        }
        Commands::Process {
            file,
            task,
            request,
        } => {
            let pipeline = Pipeline::from_config(&config).await?;
            // Files named on the command line belong to the user, so validate without `ingest`,
            // which deletes rejected uploads.
            let valid = match pipeline.validator().validate(&file) {
                ValidationVerdict::Valid(valid) => valid,
                ValidationVerdict::Invalid { reason } => {
                    bail!("{} is not a valid medical image: {}", file.display(), reason)
                }
            };
            for warning in &valid.warnings {
                eprintln!("warning: {}", warning);
            }
            let mut lifecycle = StudyLifecycle::new();
            let report = pipeline
                .process(
                    &mut lifecycle,
                    &file,
                    &ProcessRequest {
                        analysis_request: request,
                        task,
                    },
                )
                .await
                .with_context(|| format!("processing of {} failed", file.display()))?;
            print_json(&report)?;
        }
        Commands::Tasks => {
            let orchestrator = SegmentationOrchestrator::from_config(&config.segmentation).await;
            if !orchestrator.tool_available() {
                eprintln!(
                    "{} not available; only the mock task is offered",
                    config.segmentation.program
                );
            }
            for task in orchestrator.available_tasks() {
                println!("{}", task);
            }
        }
        Commands::CheckApi => {
            let Some(client) = AnalysisClient::from_config(&config.analysis)? else {
                bail!("no text-generation API key configured (set GEMINI_API_KEY)");
            };
            client
                .verify_key()
                .await
                .with_context(|| format!("{} did not answer the test prompt", client.model()))?;
            println!("{} responded; API key is valid", client.model());
        }
        Commands::Web { host, port } => web::start_server(&config, &host, port).await?,
    }

    Ok(())
}

fn output_dir_or(config: &PipelineConfig, dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = dir.unwrap_or_else(|| config.storage.processed_dir.clone());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create output directory {}", dir.display()))?;
    Ok(dir)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_slice_and_global_config_parse() {
        let cli = Cli::parse_from([
            "medimg",
            "preview",
            "scan.nii.gz",
            "--slice",
            "-1",
            "--config",
            "medimg.toml",
        ]);
        assert_eq!(cli.config.as_deref(), Some(Path::new("medimg.toml")));
        match cli.command {
            Commands::Preview { slice, .. } => assert_eq!(slice, Some(-1)),
            _ => panic!("expected preview"),
        }
    }
}
