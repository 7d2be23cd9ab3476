//
// pipeline.rs
// MedImg-Pipeline
//
// Sequences the stages for one study: validate on ingest, then decode, summarize, render a
// preview, segment and (optionally) analyze, driving the study lifecycle around the run.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::analysis::{AnalysisClient, GenerationTransport, HttpTransport};
use crate::config::PipelineConfig;
use crate::decode;
use crate::error::PipelineError;
use crate::external_tool::{ExternalTool, SubprocessTool};
use crate::image;
use crate::lifecycle::StudyLifecycle;
use crate::models::{AnalysisOutcome, ProcessReport, ValidFile, ValidationVerdict};
use crate::segmentation::SegmentationOrchestrator;
use crate::validate::MedicalFileValidator;

/// Caller options for one processing run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessRequest {
    pub analysis_request: Option<String>,
    pub task: Option<String>,
}

pub struct Pipeline<T: ExternalTool = SubprocessTool, X: GenerationTransport = HttpTransport> {
    validator: MedicalFileValidator,
    orchestrator: SegmentationOrchestrator<T>,
    analysis: Option<AnalysisClient<X>>,
    processed_dir: PathBuf,
}

impl Pipeline {
    /// Build every stage from configuration. Probes the segmentation program once.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let orchestrator = SegmentationOrchestrator::from_config(&config.segmentation).await;
        let analysis = AnalysisClient::from_config(&config.analysis)?;
        if analysis.is_none() {
            info!("no text-generation API key configured; analysis will be skipped");
        }
        Ok(Self::new(
            MedicalFileValidator::new(config.validation.max_file_bytes),
            orchestrator,
            analysis,
            config.storage.processed_dir.clone(),
        ))
    }
}

impl<T: ExternalTool, X: GenerationTransport> Pipeline<T, X> {
    pub fn new(
        validator: MedicalFileValidator,
        orchestrator: SegmentationOrchestrator<T>,
        analysis: Option<AnalysisClient<X>>,
        processed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            validator,
            orchestrator,
            analysis,
            processed_dir: processed_dir.into(),
        }
    }

    pub fn validator(&self) -> &MedicalFileValidator {
        &self.validator
    }

    pub fn orchestrator(&self) -> &SegmentationOrchestrator<T> {
        &self.orchestrator
    }

    pub fn analysis(&self) -> Option<&AnalysisClient<X>> {
        self.analysis.as_ref()
    }

    /// Validate a freshly stored file. Rejected files are deleted before the error is returned.
    pub fn ingest(&self, path: &Path) -> Result<ValidFile, PipelineError> {
        match self.validator.validate(path) {
            ValidationVerdict::Valid(valid) => Ok(valid),
            ValidationVerdict::Invalid { reason } => {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(?path, error = %e, "failed to remove rejected upload");
                    }
                }
                Err(PipelineError::Validation { reason })
            }
        }
    }

    /// Decode, summarize, render, segment, then analyze if a client is configured. Analysis
    /// failures are recorded in the report rather than failing the run.
    pub async fn run(&self, path: &Path, request: &ProcessRequest) -> Result<ProcessReport, PipelineError> {
        let owned = path.to_path_buf();
        let preview_dir = self.processed_dir.clone();
        let (info, preview) = tokio::task::spawn_blocking(move || {
            let asset = decode::decode(&owned)?;
            let info = decode::describe(&asset);
            let preview = fs::create_dir_all(&preview_dir)
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    image::prepare_for_web(&asset, &preview_dir, None).map_err(|e| e.to_string())
                });
            Ok::<_, PipelineError>((info, preview))
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))??;

        let preview = match preview {
            Ok(path) => Some(path),
            Err(reason) => {
                warn!(?path, %reason, "preview rendering failed");
                None
            }
        };

        let task = request
            .task
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(self.orchestrator.default_task());
        let segmentation = self
            .orchestrator
            .segment(path, &self.processed_dir, task)
            .await?;

        let analysis = match &self.analysis {
            None => AnalysisOutcome::Skipped {
                reason: "no text-generation API key configured".to_string(),
            },
            Some(client) => match client
                .analyze_segmentation(&segmentation.manifest, request.analysis_request.as_deref())
                .await
            {
                Ok(report) => AnalysisOutcome::Completed(report),
                Err(e) => {
                    warn!(?path, error = %e, "analysis failed; continuing without it");
                    AnalysisOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        };

        info!(
            ?path,
            organs = segmentation.manifest.summary.total_organs,
            mock = segmentation.is_mock,
            "study processed"
        );
        Ok(ProcessReport {
            image: info,
            segmentation,
            analysis: Some(analysis),
            preview,
        })
    }

    /// Run the pipeline inside a lifecycle: `begin`, `run`, then `succeed` or `fail`.
    pub async fn process(
        &self,
        lifecycle: &mut StudyLifecycle,
        path: &Path,
        request: &ProcessRequest,
    ) -> Result<ProcessReport, PipelineError> {
        lifecycle.begin()?;
        let result = self.run(path, request).await;
        match &result {
            Ok(_) => lifecycle.succeed()?,
            Err(e) => {
                warn!(?path, error = %e, "study processing failed");
                lifecycle.fail()?;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::config::SegmentationConfig;
    use crate::lifecycle::StudyStatus;

    fn mock_pipeline(processed: &Path) -> Pipeline {
        let tool = SubprocessTool::with_availability("TotalSegmentator", false);
        Pipeline::new(
            MedicalFileValidator::default(),
            SegmentationOrchestrator::new(tool, &SegmentationConfig::default()),
            None,
            processed,
        )
    }

    #[test]
    fn rejected_uploads_are_removed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("junk.dcm");
        fs::write(&path, b"definitely not dicom").expect("write");

        let err = mock_pipeline(&dir.path().join("out"))
            .ingest(&path)
            .expect_err("invalid");
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_run_marks_study_failed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("junk.nii");
        fs::write(&path, vec![0u8; 2048]).expect("write");

        let pipeline = mock_pipeline(&dir.path().join("out"));
        let mut lifecycle = StudyLifecycle::new();
        let err = pipeline
            .process(&mut lifecycle, &path, &ProcessRequest::default())
            .await
            .expect_err("decode fails");
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(lifecycle.status(), StudyStatus::Failed);
    }

    #[tokio::test]
    async fn processing_twice_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let pipeline = mock_pipeline(&dir.path().join("out"));
        let mut lifecycle = StudyLifecycle::new();
        lifecycle.begin().expect("begin");

        let err = pipeline
            .process(&mut lifecycle, &dir.path().join("any.nii"), &ProcessRequest::default())
            .await
            .expect_err("conflict");
        assert!(matches!(
            err,
            PipelineError::Lifecycle(crate::error::LifecycleError::AlreadyProcessing)
        ));
        assert_eq!(lifecycle.status(), StudyStatus::Processing);
    }
}
