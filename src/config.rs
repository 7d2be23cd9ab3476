//
// config.rs
// MedImg-Pipeline
//
// Layered pipeline configuration: built-in defaults, an optional TOML file, then environment
// variables (`MEDIMG_SECTION__KEY`, plus `GEMINI_API_KEY` for the analysis key).
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "MEDIMG_";
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub max_upload_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
            max_upload_bytes: 500 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub max_file_bytes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 500 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Executable name or path of the segmentation tool.
    pub program: String,
    pub timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub default_task: String,
    pub min_input_bytes: u64,
    pub max_input_bytes: u64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            program: "TotalSegmentator".to_string(),
            timeout_secs: 600,
            probe_timeout_secs: 10,
            default_task: "total".to_string(),
            min_input_bytes: 1024,
            max_input_bytes: 500 * MIB,
        }
    }
}

impl SegmentationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub api_url: String,
    pub model: String,
    /// Without a key the analysis stage is skipped.
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
                .to_string(),
            model: "gemini-pro".to_string(),
            api_key: None,
            max_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: 30,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            max_output_tokens: 2048,
        }
    }
}

impl AnalysisConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Number of evenly spaced slices rendered for previews.
    pub slice_count: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { slice_count: 5 }
    }
}

impl PipelineConfig {
    /// Load defaults, then `file` (if given), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = file {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
        }
        let config: Self = Self::figment(file).extract()?;
        config.check()?;
        Ok(config)
    }

    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(
                Env::raw()
                    .only(&[API_KEY_VAR])
                    .map(|_| "analysis.api_key".into()),
            )
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.analysis.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "analysis.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.segmentation.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "segmentation.program must not be empty".to_string(),
            ));
        }
        if self.segmentation.min_input_bytes > self.segmentation.max_input_bytes {
            return Err(ConfigError::Invalid(
                "segmentation.min_input_bytes exceeds segmentation.max_input_bytes".to_string(),
            ));
        }
        if self.display.slice_count == 0 {
            return Err(ConfigError::Invalid(
                "display.slice_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
