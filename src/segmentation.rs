//
// segmentation.rs
// MedImg-Pipeline
//
// Drives the external whole-body segmentation program: pre-flight checks, timed invocation,
// output-directory parsing into a manifest, and the deterministic mock used when the program
// is not installed.
//
// Thales Matheus Mendonça Santos - November 2025

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::SegmentationConfig;
use crate::error::{OrchestrationError, ResourceError};
use crate::external_tool::{ExternalTool, InvokeError, SubprocessTool};
use crate::format;
use crate::models::{ManifestFile, ManifestSummary, SegmentationManifest, SegmentationOutcome};
use crate::storage::provision_run_dir;

pub const MOCK_ORGANS: [&str; 9] = [
    "liver",
    "spleen",
    "left_kidney",
    "right_kidney",
    "stomach",
    "gallbladder",
    "pancreas",
    "left_lung",
    "right_lung",
];
pub const MOCK_PAYLOAD: &[u8] = b"mock_segmentation_data";
pub const MOCK_PROCESSING_TIME_SECS: f64 = 2.5;
pub const MOCK_CONFIDENCE: f64 = 0.75;
pub const TOOL_CONFIDENCE: f64 = 0.85;
/// Organ names listed in a manifest summary.
pub const ORGAN_PREVIEW_LIMIT: usize = 10;

pub const KNOWN_TASKS: [&str; 8] = [
    "total",
    "lung_vessels",
    "covid",
    "cerebral_bleed",
    "hip_implant",
    "coronary_arteries",
    "body",
    "pleural_pericard_effusion",
];

/// Runs segmentation through an [`ExternalTool`]. Availability is decided when the tool is
/// built and never re-probed.
pub struct SegmentationOrchestrator<T: ExternalTool = SubprocessTool> {
    tool: T,
    timeout: Duration,
    min_input_bytes: u64,
    max_input_bytes: u64,
    default_task: String,
}

impl SegmentationOrchestrator<SubprocessTool> {
    /// Probe the configured program and build an orchestrator around it.
    pub async fn from_config(config: &SegmentationConfig) -> Self {
        let tool = SubprocessTool::probe(config.program.clone(), config.probe_timeout()).await;
        Self::new(tool, config)
    }
}

impl<T: ExternalTool> SegmentationOrchestrator<T> {
    pub fn new(tool: T, config: &SegmentationConfig) -> Self {
        Self {
            tool,
            timeout: config.timeout(),
            min_input_bytes: config.min_input_bytes,
            max_input_bytes: config.max_input_bytes,
            default_task: config.default_task.clone(),
        }
    }

    pub fn tool_available(&self) -> bool {
        self.tool.available()
    }

    pub fn default_task(&self) -> &str {
        &self.default_task
    }

    pub fn available_tasks(&self) -> Vec<&'static str> {
        if self.tool.available() {
            KNOWN_TASKS.to_vec()
        } else {
            vec![KNOWN_TASKS[0]]
        }
    }

    /// Segment `input`, writing results to a fresh run directory under `output_root`.
    pub async fn segment(
        &self,
        input: &Path,
        output_root: &Path,
        task: &str,
    ) -> Result<SegmentationOutcome, OrchestrationError> {
        let started = Instant::now();

        self.preflight(input)
            .map_err(|reason| OrchestrationError::Preflight {
                reason,
                elapsed: started.elapsed(),
            })?;

        if !self.tool.available() {
            return self.mock(output_root, task, started);
        }

        let run_dir = provision_run_dir(output_root, "segmentation").map_err(|source| {
            OrchestrationError::Resource {
                source,
                elapsed: started.elapsed(),
            }
        })?;

        let args: Vec<OsString> = vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-o".into(),
            run_dir.as_os_str().to_owned(),
            "--task".into(),
            task.into(),
            "--ml".into(),
            "--quiet".into(),
        ];

        let result = match self.tool.invoke(&args, self.timeout).await {
            Ok(result) => result,
            Err(err) => {
                discard_run_dir(&run_dir);
                let elapsed = started.elapsed();
                error!(?input, error = %err, "segmentation did not complete");
                return Err(match err {
                    InvokeError::TimedOut { .. } => OrchestrationError::TimedOut {
                        limit: self.timeout,
                        elapsed,
                    },
                    other => OrchestrationError::Launch {
                        message: other.to_string(),
                        elapsed,
                    },
                });
            }
        };

        if !result.success {
            discard_run_dir(&run_dir);
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim().to_string()
            } else {
                result.stderr.trim().to_string()
            };
            error!(?input, exit_code = ?result.exit_code, %detail, "segmentation failed");
            return Err(OrchestrationError::Failed {
                exit_code: result.exit_code,
                stderr: detail,
                elapsed: started.elapsed(),
            });
        }

        let manifest = parse_output_directory(&run_dir).map_err(|source| {
            OrchestrationError::Resource {
                source,
                elapsed: started.elapsed(),
            }
        })?;
        let elapsed = started.elapsed();
        info!(
            ?input,
            organs = manifest.summary.total_organs,
            elapsed_secs = elapsed.as_secs_f64(),
            "segmentation completed"
        );

        Ok(SegmentationOutcome {
            manifest,
            task: task.to_string(),
            processing_time: elapsed.as_secs_f64(),
            confidence: TOOL_CONFIDENCE,
            is_mock: false,
        })
    }

    /// Input checks run before any invocation, mocked or real.
    pub fn preflight(&self, input: &Path) -> Result<(), String> {
        let meta = fs::metadata(input).map_err(|_| "Input file does not exist".to_string())?;
        let suffix = format::extension(input);
        if !format::detect(input).is_known() {
            return Err(format!(
                "Unsupported format: {}. Supported: {}",
                suffix,
                format::SUPPORTED_SUFFIXES.join(", ")
            ));
        }
        let size = meta.len();
        if size > self.max_input_bytes {
            return Err(format!(
                "File too large (>{}MB)",
                self.max_input_bytes / (1024 * 1024)
            ));
        }
        if size < self.min_input_bytes {
            return Err(format!("File too small (<{}KB)", self.min_input_bytes / 1024));
        }
        Ok(())
    }

    fn mock(
        &self,
        output_root: &Path,
        task: &str,
        started: Instant,
    ) -> Result<SegmentationOutcome, OrchestrationError> {
        warn!(program = self.tool.name(), "using mock segmentation");
        let fail = |source| OrchestrationError::Resource {
            source,
            elapsed: started.elapsed(),
        };

        let run_dir = provision_run_dir(output_root, "mock_segmentation").map_err(fail)?;
        let mut files = Vec::with_capacity(MOCK_ORGANS.len());
        for organ in MOCK_ORGANS {
            let filename = format!("{organ}.nii.gz");
            let path = run_dir.join(&filename);
            if let Err(source) = fs::write(&path, MOCK_PAYLOAD) {
                discard_run_dir(&run_dir);
                return Err(fail(ResourceError::Write { path, source }));
            }
            files.push(ManifestFile {
                organ: organ.to_string(),
                filename,
                path,
                size: MOCK_PAYLOAD.len() as u64,
            });
        }

        Ok(SegmentationOutcome {
            manifest: build_manifest(run_dir, files, true),
            task: task.to_string(),
            processing_time: MOCK_PROCESSING_TIME_SECS,
            confidence: MOCK_CONFIDENCE,
            is_mock: true,
        })
    }
}

/// Describe every `.nii` / `.nii.gz` file directly inside `dir`, ordered by file name.
pub fn parse_output_directory(dir: &Path) -> Result<SegmentationManifest, ResourceError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ResourceError::Read {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if format::detect(&filename) != format::MedicalFormat::Nifti {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| ResourceError::Read {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?
            .len();
        files.push(ManifestFile {
            organ: format::base_name(&filename),
            filename,
            path: entry.path().to_path_buf(),
            size,
        });
    }
    Ok(build_manifest(dir.to_path_buf(), files, false))
}

fn build_manifest(output_directory: PathBuf, files: Vec<ManifestFile>, is_mock: bool) -> SegmentationManifest {
    let segmented_organs: Vec<String> = files.iter().map(|f| f.organ.clone()).collect();
    let summary = ManifestSummary {
        total_organs: segmented_organs.len(),
        organs_found: segmented_organs
            .iter()
            .take(ORGAN_PREVIEW_LIMIT)
            .cloned()
            .collect(),
        total_files: files.len(),
    };
    SegmentationManifest {
        timestamp: Utc::now(),
        output_directory,
        segmented_organs,
        files,
        summary,
        is_mock,
    }
}

fn discard_run_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!(?dir, error = %e, "failed to remove segmentation run directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    use crate::external_tool::ExitResult;

    struct FakeTool {
        available: bool,
        calls: AtomicUsize,
    }

    impl FakeTool {
        fn new(available: bool) -> Self {
            Self {
                available,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ExternalTool for FakeTool {
        fn name(&self) -> &str {
            "fake"
        }

        fn available(&self) -> bool {
            self.available
        }

        async fn invoke(&self, args: &[OsString], _timeout: Duration) -> Result<ExitResult, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let out = PathBuf::from(&args[3]);
            fs::write(out.join("spleen.nii.gz"), b"s").map_err(InvokeError::Io)?;
            fs::write(out.join("aorta.nii"), b"aa").map_err(InvokeError::Io)?;
            fs::write(out.join("log.txt"), b"ignored").map_err(InvokeError::Io)?;
            Ok(ExitResult {
                exit_code: Some(0),
                success: true,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: Duration::from_millis(5),
            })
        }
    }

    fn input_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![1u8; size]).expect("write input");
        path
    }

    #[tokio::test]
    async fn mock_output_is_deterministic() {
        let dir = tempdir().expect("tempdir");
        let input = input_file(dir.path(), "scan.nii.gz", 2048);
        let orchestrator =
            SegmentationOrchestrator::new(FakeTool::new(false), &SegmentationConfig::default());

        let first = orchestrator
            .segment(&input, &dir.path().join("out"), "total")
            .await
            .expect("mock");
        let second = orchestrator
            .segment(&input, &dir.path().join("out"), "total")
            .await
            .expect("mock");

        for outcome in [&first, &second] {
            assert!(outcome.is_mock);
            assert!(outcome.manifest.is_mock);
            assert_eq!(outcome.confidence, MOCK_CONFIDENCE);
            assert_eq!(outcome.processing_time, MOCK_PROCESSING_TIME_SECS);
            assert_eq!(outcome.manifest.segmented_organs, MOCK_ORGANS.to_vec());
            assert_eq!(outcome.manifest.summary.total_files, 9);
            for file in &outcome.manifest.files {
                assert_eq!(fs::read(&file.path).expect("mock file"), MOCK_PAYLOAD);
            }
        }
        assert_ne!(first.manifest.output_directory, second.manifest.output_directory);
        assert_eq!(orchestrator.tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.available_tasks(), vec!["total"]);
    }

    #[tokio::test]
    async fn preflight_runs_before_mocking() {
        let dir = tempdir().expect("tempdir");
        let orchestrator =
            SegmentationOrchestrator::new(FakeTool::new(false), &SegmentationConfig::default());

        let tiny = input_file(dir.path(), "tiny.dcm", 10);
        let err = orchestrator
            .segment(&tiny, dir.path(), "total")
            .await
            .expect_err("too small");
        assert!(matches!(err, OrchestrationError::Preflight { ref reason, .. } if reason.contains("too small")));

        let text = input_file(dir.path(), "notes.txt", 4096);
        assert!(orchestrator.preflight(&text).is_err());
        assert!(orchestrator.preflight(&dir.path().join("missing.nii")).is_err());
    }

    #[tokio::test]
    async fn available_tool_output_is_parsed_in_name_order() {
        let dir = tempdir().expect("tempdir");
        let input = input_file(dir.path(), "ct.nii", 4096);
        let orchestrator =
            SegmentationOrchestrator::new(FakeTool::new(true), &SegmentationConfig::default());

        let outcome = orchestrator
            .segment(&input, &dir.path().join("out"), "body")
            .await
            .expect("segment");
        assert!(!outcome.is_mock);
        assert_eq!(outcome.task, "body");
        assert_eq!(outcome.confidence, TOOL_CONFIDENCE);
        assert_eq!(outcome.manifest.segmented_organs, vec!["aorta", "spleen"]);
        assert_eq!(outcome.manifest.files[0].size, 2);
        assert_eq!(orchestrator.available_tasks().len(), KNOWN_TASKS.len());
    }

    #[test]
    fn summary_lists_at_most_ten_organs() {
        let dir = tempdir().expect("tempdir");
        for i in 0..12 {
            fs::write(dir.path().join(format!("organ_{i:02}.nii.gz")), b"x").expect("write");
        }
        let manifest = parse_output_directory(dir.path()).expect("parse");
        assert_eq!(manifest.summary.total_organs, 12);
        assert_eq!(manifest.summary.total_files, 12);
        assert_eq!(manifest.summary.organs_found.len(), ORGAN_PREVIEW_LIMIT);
        assert_eq!(manifest.summary.organs_found[0], "organ_00");
        assert!(!manifest.is_mock);
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn tool(dir: &Path, body: &str) -> SubprocessTool {
            let path = dir.join("TotalSegmentator");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
            SubprocessTool::with_availability(path.to_string_lossy(), true)
        }

        fn config(timeout_secs: u64) -> SegmentationConfig {
            SegmentationConfig {
                timeout_secs,
                ..SegmentationConfig::default()
            }
        }

        #[tokio::test]
        async fn script_output_becomes_manifest() {
            let dir = tempdir().expect("tempdir");
            let input = input_file(dir.path(), "ct.nii.gz", 2048);
            let tool = tool(
                dir.path(),
                "printf x > \"$4/liver.nii.gz\"\nprintf yy > \"$4/spleen.nii\"\necho done > \"$4/notes.txt\"",
            );
            let orchestrator = SegmentationOrchestrator::new(tool, &config(30));

            let outcome = orchestrator
                .segment(&input, &dir.path().join("runs"), "total")
                .await
                .expect("segment");
            assert_eq!(outcome.manifest.segmented_organs, vec!["liver", "spleen"]);
            assert!(outcome
                .manifest
                .output_directory
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("segmentation_")));
        }

        #[tokio::test]
        async fn non_zero_exit_reports_stderr_and_cleans_up() {
            let dir = tempdir().expect("tempdir");
            let input = input_file(dir.path(), "ct.nii.gz", 2048);
            let runs = dir.path().join("runs");
            let tool = tool(dir.path(), "echo 'CUDA out of memory' >&2\nexit 3");
            let orchestrator = SegmentationOrchestrator::new(tool, &config(30));

            let err = orchestrator
                .segment(&input, &runs, "total")
                .await
                .expect_err("failure");
            match err {
                OrchestrationError::Failed {
                    exit_code, stderr, ..
                } => {
                    assert_eq!(exit_code, Some(3));
                    assert_eq!(stderr, "CUDA out of memory");
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(fs::read_dir(&runs).expect("runs").count(), 0);
        }

        #[tokio::test]
        async fn timeout_is_reported_with_elapsed_time() {
            let dir = tempdir().expect("tempdir");
            let input = input_file(dir.path(), "ct.nii.gz", 2048);
            let tool = tool(dir.path(), "exec sleep 30");
            let mut orchestrator = SegmentationOrchestrator::new(tool, &config(30));
            orchestrator.timeout = Duration::from_millis(300);

            let err = orchestrator
                .segment(&input, &dir.path().join("runs"), "total")
                .await
                .expect_err("timeout");
            assert!(err.is_timeout());
            assert!(err.elapsed() >= Duration::from_millis(300));
            assert!(err.elapsed() < Duration::from_secs(10));
        }
    }
}
