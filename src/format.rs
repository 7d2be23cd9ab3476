//
// format.rs
// MedImg-Pipeline
//
// Classifies medical image paths as DICOM or NIFTI, handling the compound .nii.gz suffix.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

const COMPOUND_SUFFIXES: &[&str] = &[".nii.gz"];
const NIFTI_SUFFIXES: &[&str] = &[".nii", ".nii.gz"];
const DICOM_SUFFIXES: &[&str] = &[".dcm"];

/// Supported suffixes, in the order they are reported to users.
pub const SUPPORTED_SUFFIXES: &[&str] = &[".dcm", ".nii", ".nii.gz"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MedicalFormat {
    Dicom,
    Nifti,
    Unknown,
}

impl MedicalFormat {
    pub fn is_known(self) -> bool {
        !matches!(self, MedicalFormat::Unknown)
    }

    pub fn label(self) -> &'static str {
        match self {
            MedicalFormat::Dicom => "DICOM",
            MedicalFormat::Nifti => "NIFTI",
            MedicalFormat::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MedicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lower-cased suffix of a path. `.nii.gz` is recognized as one suffix; anything else falls
/// back to the last extension (`scan.tar.gz` yields `.gz`). Returns an empty string when the
/// name has no extension.
pub fn extension(path: impl AsRef<Path>) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if let Some(compound) = COMPOUND_SUFFIXES.iter().find(|s| name.ends_with(*s)) {
        return (*compound).to_string();
    }

    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_string(),
        _ => String::new(),
    }
}

/// Classify a path by suffix only. No I/O is performed.
pub fn detect(path: impl AsRef<Path>) -> MedicalFormat {
    let ext = extension(path);
    if NIFTI_SUFFIXES.contains(&ext.as_str()) {
        MedicalFormat::Nifti
    } else if DICOM_SUFFIXES.contains(&ext.as_str()) {
        MedicalFormat::Dicom
    } else {
        MedicalFormat::Unknown
    }
}

/// File name with its recognized medical suffix removed (`liver.nii.gz` -> `liver`).
/// Names without a recognized suffix lose only their last extension.
pub fn base_name(file_name: &str) -> String {
    let lower = file_name.to_lowercase();
    for suffix in SUPPORTED_SUFFIXES.iter().rev() {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            return file_name[..file_name.len() - suffix.len()].to_string();
        }
    }
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

/// Content-based classification for files whose suffix is not recognized.
///
/// Looks for the `DICM` marker after the 128-byte preamble (or at the start of preamble-less
/// files) and for the NIfTI-1 magic at offset 344. Gzip streams count as compressed NIfTI.
pub fn sniff(path: impl AsRef<Path>) -> MedicalFormat {
    let mut header = Vec::with_capacity(352);
    let read = File::open(path.as_ref())
        .and_then(|f| f.take(352).read_to_end(&mut header))
        .unwrap_or(0);
    let header = &header[..read];

    if header.len() >= 2 && header[0] == 0x1f && header[1] == 0x8b {
        return MedicalFormat::Nifti;
    }
    if header.len() >= 132 && &header[128..132] == b"DICM" {
        return MedicalFormat::Dicom;
    }
    if header.starts_with(b"DICM") {
        return MedicalFormat::Dicom;
    }
    if header.len() >= 348 && (&header[344..348] == b"n+1\0" || &header[344..348] == b"ni1\0") {
        return MedicalFormat::Nifti;
    }
    MedicalFormat::Unknown
}

/// Suffix detection first, then content sniffing.
pub fn detect_with_content(path: impl AsRef<Path>) -> MedicalFormat {
    match detect(path.as_ref()) {
        MedicalFormat::Unknown => sniff(path),
        known => known,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn compound_suffix_is_nifti() {
        assert_eq!(detect("scan.nii.gz"), MedicalFormat::Nifti);
        assert_eq!(detect("/data/SCAN.NII.GZ"), MedicalFormat::Nifti);
        assert_eq!(extension("scan.nii.gz"), ".nii.gz");
    }

    #[test]
    fn single_suffixes_are_case_insensitive() {
        assert_eq!(detect("brain.nii"), MedicalFormat::Nifti);
        assert_eq!(detect("IMAGE.DCM"), MedicalFormat::Dicom);
        assert_eq!(detect("notes.txt"), MedicalFormat::Unknown);
        assert_eq!(detect("archive.tar.gz"), MedicalFormat::Unknown);
        assert_eq!(extension("archive.tar.gz"), ".gz");
        assert_eq!(extension("README"), "");
    }

    #[test]
    fn base_name_strips_compound_suffix() {
        assert_eq!(base_name("liver.nii.gz"), "liver");
        assert_eq!(base_name("left_kidney.nii"), "left_kidney");
        assert_eq!(base_name("slice.DCM"), "slice");
        assert_eq!(base_name("summary.json"), "summary");
    }

    #[test]
    fn sniff_recognizes_dicom_preamble() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("no_extension");
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&path, &bytes).expect("write");

        assert_eq!(detect(&path), MedicalFormat::Unknown);
        assert_eq!(detect_with_content(&path), MedicalFormat::Dicom);
    }

    #[test]
    fn sniff_recognizes_dicom_without_preamble() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bare_meta");
        let mut bytes = b"DICM".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&path, &bytes).expect("write");

        assert_eq!(detect_with_content(&path), MedicalFormat::Dicom);
    }

    #[test]
    fn sniff_gives_up_on_unrelated_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("random.bin");
        fs::write(&path, b"definitely not an image").expect("write");
        assert_eq!(sniff(&path), MedicalFormat::Unknown);
    }
}
