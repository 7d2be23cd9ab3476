//
// models.rs
// MedImg-Pipeline
//
// Defines the data structures shared by the pipeline: decoded assets, validation verdicts,
// statistics, segmentation manifests and processing reports.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::format::MedicalFormat;

/// Identifiers read from the file itself, as opposed to identifiers supplied at upload time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceIdentifiers {
    pub patient_id: Option<String>,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
}

/// Voxel/pixel geometry. Fields that a format does not carry stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialMetadata {
    pub spacing: Vec<f64>,
    pub orientation: Option<Vec<f64>>,
    pub position: Option<Vec<f64>>,
    pub affine: Option<[[f64; 4]; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DicomMetadata {
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub institution: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub slice_thickness: Option<f64>,
    pub rows: u32,
    pub columns: u32,
    pub number_of_frames: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: Option<u16>,
    pub photometric_interpretation: Option<String>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NiftiMetadata {
    pub voxel_size: Vec<f64>,
    pub data_type: String,
    pub space_unit: String,
    pub time_unit: String,
    pub qform_code: i16,
    pub sform_code: i16,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatMetadata {
    Dicom(DicomMetadata),
    Nifti(NiftiMetadata),
}

/// Decoded sample values. 8-bit data is kept as-is so it can be displayed without rescaling.
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelData {
    U8(ArrayD<u8>),
    F32(ArrayD<f32>),
}

impl VoxelData {
    pub fn shape(&self) -> &[usize] {
        match self {
            VoxelData::U8(a) => a.shape(),
            VoxelData::F32(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VoxelData::U8(a) => a.len(),
            VoxelData::F32(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to f64, in logical (row-major) order.
    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            VoxelData::U8(a) => Box::new(a.iter().map(|&v| v as f64)),
            VoxelData::F32(a) => Box::new(a.iter().map(|&v| v as f64)),
        }
    }
}

/// Voxel data plus its channel count. When `channels > 1` the last axis is the channel axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub voxels: VoxelData,
    pub channels: usize,
}

impl Volume {
    pub fn new(voxels: VoxelData) -> Self {
        Self {
            voxels,
            channels: 1,
        }
    }

    pub fn with_channels(voxels: VoxelData, channels: usize) -> Self {
        Self {
            voxels,
            channels: channels.max(1),
        }
    }

    /// Number of axes excluding the channel axis.
    pub fn spatial_ndim(&self) -> usize {
        let ndim = self.voxels.shape().len();
        if self.channels > 1 {
            ndim.saturating_sub(1)
        } else {
            ndim
        }
    }

    /// Extent of the depth axis (axis 2); 1 for planar images.
    pub fn depth(&self) -> usize {
        if self.spatial_ndim() >= 3 {
            self.voxels.shape()[2]
        } else {
            1
        }
    }
}

/// A fully decoded medical image. Immutable once produced by the decoder.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub path: PathBuf,
    pub format: MedicalFormat,
    pub shape: Vec<usize>,
    pub element_type: String,
    pub spatial: SpatialMetadata,
    pub modality: Option<String>,
    pub identifiers: SourceIdentifiers,
    pub metadata: FormatMetadata,
    pub volume: Volume,
}

/// Serializable view of an asset without its voxels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub format: MedicalFormat,
    pub shape: Vec<usize>,
    pub element_type: String,
    pub modality: Option<String>,
    pub identifiers: SourceIdentifiers,
    pub spatial: SpatialMetadata,
    pub metadata: FormatMetadata,
    pub statistics: StatisticalSummary,
    pub slices: usize,
}

/// Aggregate statistics over NaN-excluded sample values.
///
/// When no values remain after NaN exclusion every numeric field is zero and `has_data` is false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticalSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub percentile_5: f64,
    pub percentile_95: f64,
    pub non_zero_count: usize,
    pub total_voxels: usize,
    pub has_data: bool,
}

/// Facts reported for a structurally sound file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidFile {
    pub format: MedicalFormat,
    pub modality: String,
    pub dimensions: Vec<usize>,
    pub identifiers: SourceIdentifiers,
    pub element_type: String,
    pub voxel_sizes: Option<Vec<f64>>,
    pub file_size: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Valid(ValidFile),
    Invalid { reason: String },
}

impl ValidationVerdict {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ValidationVerdict::Invalid {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub organ: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub total_organs: usize,
    pub organs_found: Vec<String>,
    pub total_files: usize,
}

/// Description of one segmentation run's output directory at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationManifest {
    pub timestamp: DateTime<Utc>,
    pub output_directory: PathBuf,
    pub segmented_organs: Vec<String>,
    pub files: Vec<ManifestFile>,
    pub summary: ManifestSummary,
    pub is_mock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationOutcome {
    pub manifest: SegmentationManifest,
    pub task: String,
    /// Seconds.
    pub processing_time: f64,
    pub confidence: f64,
    pub is_mock: bool,
}

/// Text returned by the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub text: String,
    pub confidence: f64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Completed(AnalysisReport),
    Failed { reason: String },
    Skipped { reason: String },
}

/// Everything a successful pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub image: ImageInfo,
    pub segmentation: SegmentationOutcome,
    pub analysis: Option<AnalysisOutcome>,
    /// Browser-viewable PNG of the middle slice, when rendering succeeded.
    pub preview: Option<PathBuf>,
}
