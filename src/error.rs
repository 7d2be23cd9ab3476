//
// error.rs
// MedImg-Pipeline
//
// Typed error taxonomy shared by every pipeline stage, plus the aggregate error surfaced to callers.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Filesystem failures: directories that cannot be created, files that cannot be read or written.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("cannot create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("cannot read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("{path:?} is outside the storage root")]
    OutsideRoot { path: PathBuf },
}

/// Raised when the format library cannot parse a file that is about to be fully decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("DICOM decoding failed: {0}")]
    Dicom(String),
    #[error("NIFTI decoding failed: {0}")]
    Nifti(String),
    #[error("unsupported pixel layout: {0}")]
    Layout(String),
}

/// Failures while turning normalized rasters into image files.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot render array of shape {0:?} as an image")]
    Layout(Vec<usize>),
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Failures of a segmentation invocation. Every variant records how long the attempt took.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("segmentation input rejected: {reason}")]
    Preflight { reason: String, elapsed: Duration },
    #[error("failed to launch segmentation program: {message}")]
    Launch { message: String, elapsed: Duration },
    #[error("segmentation failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
        elapsed: Duration,
    },
    #[error("segmentation timeout (>{} seconds)", limit.as_secs())]
    TimedOut { limit: Duration, elapsed: Duration },
    #[error("segmentation output unavailable: {source}")]
    Resource {
        source: ResourceError,
        elapsed: Duration,
    },
}

impl OrchestrationError {
    /// Wall-clock time spent before the failure surfaced.
    pub fn elapsed(&self) -> Duration {
        match self {
            OrchestrationError::Preflight { elapsed, .. }
            | OrchestrationError::Launch { elapsed, .. }
            | OrchestrationError::Failed { elapsed, .. }
            | OrchestrationError::TimedOut { elapsed, .. }
            | OrchestrationError::Resource { elapsed, .. } => *elapsed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestrationError::TimedOut { .. })
    }
}

/// Terminal failures of the text-generation client.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid response format from text-generation API: {0}")]
    InvalidResponse(String),
    #[error("text-generation request failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("failed to build text-generation client: {0}")]
    Client(String),
}

/// Rejected study state changes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("study is already being processed")]
    AlreadyProcessing,
    #[error("study is in terminal state '{0}'; resubmit to start a new lifecycle")]
    Terminal(&'static str),
    #[error("cannot {event} a study in state '{state}'")]
    InvalidTransition {
        event: &'static str,
        state: &'static str,
    },
}

/// Upload failures: either the content is rejected or the filesystem refused the write.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

/// Aggregate error for a full pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid medical image file: {reason}")]
    Validation { reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<IngestError> for PipelineError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Rejected(reason) => PipelineError::Validation { reason },
            IngestError::Resource(source) => PipelineError::Resource(source),
        }
    }
}
