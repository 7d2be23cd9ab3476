use std::fs;
use std::path::Path;

use dicom_dictionary_std::tags;
use dicom_pixeldata::PixelDecoder;
use tracing::{debug, warn};

use crate::decode;
use crate::dicom_access::ElementAccess;
use crate::format::{self, MedicalFormat, SUPPORTED_SUFFIXES};
use crate::metadata;
use crate::models::{ValidFile, ValidationVerdict, VoxelData};
use crate::stats;

/// NIFTI headers carry no modality; uploads are reported as MRI.
pub const NIFTI_DEFAULT_MODALITY: &str = "MRI";
pub const UNKNOWN_MODALITY: &str = "UNKNOWN";
pub const DEFAULT_MAX_FILE_BYTES: u64 = 500 * 1024 * 1024;

/// Classifies files as structurally sound or not. Never fails: every problem becomes `Invalid`.
#[derive(Debug, Clone)]
pub struct MedicalFileValidator {
    max_file_bytes: u64,
}

impl Default for MedicalFileValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_BYTES)
    }
}

impl MedicalFileValidator {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    pub fn validate(&self, path: &Path) -> ValidationVerdict {
        let verdict = self.validate_inner(path);
        match &verdict {
            ValidationVerdict::Valid(v) => {
                debug!(?path, format = %v.format, dims = ?v.dimensions, "file validated")
            }
            ValidationVerdict::Invalid { reason } => warn!(?path, %reason, "file rejected"),
        }
        verdict
    }

    fn validate_inner(&self, path: &Path) -> ValidationVerdict {
        let file_size = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return ValidationVerdict::invalid("Path is not a regular file"),
            Err(_) => return ValidationVerdict::invalid("File does not exist"),
        };
        if file_size == 0 {
            return ValidationVerdict::invalid("File is empty");
        }
        if file_size > self.max_file_bytes {
            return ValidationVerdict::invalid(format!(
                "File too large (>{}MB)",
                self.max_file_bytes / (1024 * 1024)
            ));
        }

        match format::detect_with_content(path) {
            MedicalFormat::Dicom => validate_dicom(path, file_size),
            MedicalFormat::Nifti => validate_nifti(path, file_size),
            MedicalFormat::Unknown => ValidationVerdict::invalid(format!(
                "Unsupported file format. Only DICOM and NIFTI ({}) are supported",
                SUPPORTED_SUFFIXES.join(", ")
            )),
        }
    }
}

fn validate_dicom(path: &Path, file_size: u64) -> ValidationVerdict {
    let obj = match decode::open_dicom(path) {
        Ok(obj) => obj,
        Err(e) => return ValidationVerdict::invalid(format!("File is not a valid DICOM file: {e}")),
    };

    if !obj.has_element(tags::PIXEL_DATA) {
        return ValidationVerdict::invalid("DICOM file does not contain image data");
    }

    let rows = obj.element_u32(tags::ROWS).unwrap_or(0);
    let columns = obj.element_u32(tags::COLUMNS).unwrap_or(0);
    if rows == 0 || columns == 0 {
        return ValidationVerdict::invalid("Invalid image dimensions");
    }

    let decoded = match obj.decode_pixel_data() {
        Ok(decoded) => decoded,
        Err(e) => return ValidationVerdict::invalid(format!("Cannot read DICOM pixel data: {e}")),
    };
    let frames = decoded.number_of_frames() as usize;
    let samples = decoded.samples_per_pixel() as usize;
    let expected = frames * decoded.rows() as usize * decoded.columns() as usize * samples;
    if expected == 0 || decoded.data().is_empty() {
        return ValidationVerdict::invalid("DICOM file contains empty image data");
    }

    let mut dimensions = vec![decoded.rows() as usize, decoded.columns() as usize];
    if frames > 1 {
        dimensions.push(frames);
    }
    if samples > 1 {
        dimensions.push(samples);
    }

    let (identifiers, missing) = metadata::dicom_identifiers(&obj);
    let mut warnings = Vec::new();
    if !missing.is_empty() {
        warnings.push(format!("Missing DICOM elements: {}", missing.join(", ")));
    }

    let unsigned = decoded.pixel_representation() == dicom_pixeldata::PixelRepresentation::Unsigned;
    ValidationVerdict::Valid(ValidFile {
        format: MedicalFormat::Dicom,
        modality: metadata::dicom_modality(&obj).unwrap_or_else(|| UNKNOWN_MODALITY.to_string()),
        dimensions,
        identifiers,
        element_type: format!(
            "{}int{}",
            if unsigned { "u" } else { "" },
            decoded.bits_allocated()
        ),
        voxel_sizes: None,
        file_size,
        warnings,
    })
}

fn validate_nifti(path: &Path, file_size: u64) -> ValidationVerdict {
    let (header, data_type, voxels) = match decode::read_nifti(path) {
        Ok(parts) => parts,
        Err(e) => return ValidationVerdict::invalid(format!("Cannot read NIFTI image data: {e}")),
    };

    if voxels.is_empty() {
        return ValidationVerdict::invalid("NIFTI file contains empty image data");
    }

    let shape = voxels.shape().to_vec();
    if shape.len() < 2 {
        return ValidationVerdict::invalid("Invalid image dimensions (must be at least 2D)");
    }
    if shape.len() > 4 {
        return ValidationVerdict::invalid("Unsupported image dimensions (max 4D supported)");
    }

    if is_constant(&voxels) {
        return ValidationVerdict::invalid(
            "Image contains no variation (all pixels have same value)",
        );
    }

    ValidationVerdict::Valid(ValidFile {
        format: MedicalFormat::Nifti,
        modality: NIFTI_DEFAULT_MODALITY.to_string(),
        voxel_sizes: Some(metadata::nifti_voxel_size(&header, shape.len())),
        dimensions: shape,
        identifiers: Default::default(),
        element_type: decode::nifti_type_name(data_type),
        file_size,
        warnings: Vec::new(),
    })
}

/// True when every non-NaN voxel holds the same value (or there are none).
fn is_constant(voxels: &VoxelData) -> bool {
    let summary = stats::summarize(voxels);
    !summary.has_data || summary.min == summary.max
}

pub const MAX_PATIENT_ID_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
const FORBIDDEN_ID_CHARS: [char; 8] = ['<', '>', '"', '\'', '&', '\n', '\r', '\t'];

/// Trimmed, upper-cased patient identifier suitable for storing with a study.
pub fn normalize_patient_id(raw: &str) -> Result<String, String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err("Patient ID cannot be empty".to_string());
    }
    if id.chars().count() > MAX_PATIENT_ID_LEN {
        return Err(format!("Patient ID too long (max {MAX_PATIENT_ID_LEN} characters)"));
    }
    if let Some(c) = id.chars().find(|c| FORBIDDEN_ID_CHARS.contains(c)) {
        return Err(format!("Patient ID contains invalid character: {c:?}"));
    }
    Ok(id.to_uppercase())
}

pub fn normalize_description(raw: &str) -> Result<String, String> {
    let description = raw.trim();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(format!("Description too long (max {MAX_DESCRIPTION_LEN} characters)"));
    }
    Ok(description.to_string())
}
