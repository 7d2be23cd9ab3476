use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use nifti::NiftiHeader;

use crate::dicom_access::ElementAccess;
use crate::models::{DicomMetadata, NiftiMetadata, SourceIdentifiers, SpatialMetadata};

/// Patient/study/series identifiers together with the attribute names that were missing.
pub fn dicom_identifiers<T: ElementAccess>(obj: &T) -> (SourceIdentifiers, Vec<&'static str>) {
    let identifiers = SourceIdentifiers {
        patient_id: obj.element_str(tags::PATIENT_ID),
        study_uid: obj.element_str(tags::STUDY_INSTANCE_UID),
        series_uid: obj.element_str(tags::SERIES_INSTANCE_UID),
    };

    let mut missing = Vec::new();
    if identifiers.patient_id.is_none() {
        missing.push("PatientID");
    }
    if identifiers.study_uid.is_none() {
        missing.push("StudyInstanceUID");
    }
    if identifiers.series_uid.is_none() {
        missing.push("SeriesInstanceUID");
    }
    (identifiers, missing)
}

pub fn dicom_modality<T: ElementAccess>(obj: &T) -> Option<String> {
    obj.element_str(tags::MODALITY)
}

pub fn dicom_spatial<T: ElementAccess>(obj: &T) -> SpatialMetadata {
    let mut spacing = obj.element_f64s(tags::PIXEL_SPACING).unwrap_or_default();
    if let (false, Some(thickness)) = (spacing.is_empty(), obj.element_f64(tags::SLICE_THICKNESS)) {
        spacing.push(thickness);
    }

    SpatialMetadata {
        spacing,
        orientation: obj.element_f64s(tags::IMAGE_ORIENTATION_PATIENT),
        position: obj.element_f64s(tags::IMAGE_POSITION_PATIENT),
        affine: None,
    }
}

pub fn extract_dicom_metadata(obj: &DefaultDicomObject) -> DicomMetadata {
    DicomMetadata {
        study_date: obj.element_str(tags::STUDY_DATE),
        study_time: obj.element_str(tags::STUDY_TIME),
        institution: obj.element_str(tags::INSTITUTION_NAME),
        manufacturer: obj.element_str(tags::MANUFACTURER),
        model: obj.element_str(tags::MANUFACTURER_MODEL_NAME),
        slice_thickness: obj.element_f64(tags::SLICE_THICKNESS),
        rows: obj.element_u32(tags::ROWS).unwrap_or(0),
        columns: obj.element_u32(tags::COLUMNS).unwrap_or(0),
        number_of_frames: obj.element_u32(tags::NUMBER_OF_FRAMES).unwrap_or(1),
        samples_per_pixel: obj
            .element_u32(tags::SAMPLES_PER_PIXEL)
            .map(|v| v as u16)
            .unwrap_or(1),
        bits_allocated: obj
            .element_u32(tags::BITS_ALLOCATED)
            .map(|v| v as u16)
            .unwrap_or(0),
        bits_stored: obj.element_u32(tags::BITS_STORED).map(|v| v as u16),
        photometric_interpretation: obj.element_str(tags::PHOTOMETRIC_INTERPRETATION),
        window_center: obj.element_f64(tags::WINDOW_CENTER),
        window_width: obj.element_f64(tags::WINDOW_WIDTH),
        rescale_slope: obj.element_f64(tags::RESCALE_SLOPE),
        rescale_intercept: obj.element_f64(tags::RESCALE_INTERCEPT),
    }
}

impl DicomMetadata {
    /// True when the modality LUT would change stored values.
    pub fn has_rescale(&self) -> bool {
        let slope = self.rescale_slope.unwrap_or(1.0);
        let intercept = self.rescale_intercept.unwrap_or(0.0);
        slope != 1.0 || intercept != 0.0
    }
}

fn space_unit(xyzt_units: u8) -> &'static str {
    match xyzt_units & 0x07 {
        1 => "meter",
        2 => "mm",
        3 => "micron",
        _ => "unknown",
    }
}

fn time_unit(xyzt_units: u8) -> &'static str {
    match xyzt_units & 0x38 {
        8 => "sec",
        16 => "msec",
        24 => "usec",
        _ => "unknown",
    }
}

/// Per-axis voxel sizes for the first `ndim` axes.
pub fn nifti_voxel_size(header: &NiftiHeader, ndim: usize) -> Vec<f64> {
    header
        .pixdim
        .iter()
        .skip(1)
        .take(ndim)
        .map(|&v| v as f64)
        .collect()
}

/// Voxel-to-world affine: the sform when its code is set, then the qform, then the
/// pixdim-scaled base transform centred on the volume.
pub fn nifti_affine(header: &NiftiHeader) -> [[f64; 4]; 4] {
    let m = affine_safe_header(header).affine::<f64>();
    std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]))
}

/// Copy of `header` that `NiftiHeader::affine` cannot panic on: qfac forced to +-1,
/// absolute spacings, a quaternion of at most unit length and 3 to 7 dimensions.
fn affine_safe_header(header: &NiftiHeader) -> NiftiHeader {
    let mut safe = header.clone();
    let qfac = safe.pixdim[0];
    safe.pixdim[0] = if (qfac.abs() - 1.0).abs() < 1e-6 { qfac.signum() } else { 1.0 };
    for spacing in &mut safe.pixdim[1..4] {
        *spacing = spacing.abs();
    }
    let norm = (safe.quatern_b.powi(2) + safe.quatern_c.powi(2) + safe.quatern_d.powi(2)).sqrt();
    if norm > 1.0 {
        safe.quatern_b /= norm;
        safe.quatern_c /= norm;
        safe.quatern_d /= norm;
    }
    safe.dim[0] = safe.dim[0].clamp(3, 7);
    safe
}

pub fn extract_nifti_metadata(header: &NiftiHeader, ndim: usize, data_type: String) -> NiftiMetadata {
    let description = String::from_utf8_lossy(&header.descrip)
        .trim_end_matches('\0')
        .trim()
        .to_string();

    NiftiMetadata {
        voxel_size: nifti_voxel_size(header, ndim),
        data_type,
        space_unit: space_unit(header.xyzt_units).to_string(),
        time_unit: time_unit(header.xyzt_units).to_string(),
        qform_code: header.qform_code,
        sform_code: header.sform_code,
        description,
    }
}
