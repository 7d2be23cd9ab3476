//
// pipeline_workflows.rs
// MedImg-Pipeline
//
// Integration-style tests covering validation, decoding, statistics, display rendering, mock
// segmentation and the study lifecycle on DICOM and NIFTI fixtures built on the fly.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use flate2::write::GzEncoder;
use flate2::Compression;
use medimg_pipeline::config::SegmentationConfig;
use medimg_pipeline::external_tool::SubprocessTool;
use medimg_pipeline::format::{self, MedicalFormat};
use medimg_pipeline::lifecycle::{StudyLifecycle, StudyStatus};
use medimg_pipeline::models::{AnalysisOutcome, ValidationVerdict, VoxelData};
use medimg_pipeline::segmentation::{SegmentationOrchestrator, MOCK_ORGANS};
use medimg_pipeline::validate::MedicalFileValidator;
use medimg_pipeline::{decode, image, stats, Pipeline, PipelineError, ProcessRequest};
use ndarray::Array3;
use nifti::writer::WriterOptions;
use tempfile::{tempdir, TempDir};

const SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
const SOP_INSTANCE: &str = "1.2.826.0.1.3680043.2.1125.1";

fn put(obj: &mut InMemDicomObject, tag: dicom::core::Tag, vr: VR, value: PrimitiveValue) {
    obj.put(DataElement::new(tag, vr, value));
}

/// Pixel layout and optional tags for a generated Secondary Capture instance.
struct DicomFixture {
    rows: u16,
    columns: u16,
    frames: u32,
    bits: u16,
    pixels: Vec<u8>,
    with_identifiers: bool,
    rescale: Option<(&'static str, &'static str)>,
}

fn write_dicom(path: &Path, fixture: DicomFixture) {
    let DicomFixture {
        rows,
        columns,
        frames,
        bits,
        pixels,
        with_identifiers,
        rescale,
    } = fixture;
    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    put(&mut obj, tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(SOP_CLASS));
    put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(SOP_INSTANCE));
    if with_identifiers {
        put(&mut obj, tags::PATIENT_ID, VR::LO, PrimitiveValue::from("PAT123"));
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4"));
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4.5"));
        put(&mut obj, tags::MODALITY, VR::CS, PrimitiveValue::from("CT"));
        put(&mut obj, tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20240101"));
    }

    put(&mut obj, tags::ROWS, VR::US, PrimitiveValue::from(rows));
    put(&mut obj, tags::COLUMNS, VR::US, PrimitiveValue::from(columns));
    put(&mut obj, tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16));
    put(&mut obj, tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(bits));
    put(&mut obj, tags::BITS_STORED, VR::US, PrimitiveValue::from(bits));
    put(&mut obj, tags::HIGH_BIT, VR::US, PrimitiveValue::from(bits - 1));
    put(&mut obj, tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16));
    put(
        &mut obj,
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    );
    put(
        &mut obj,
        tags::NUMBER_OF_FRAMES,
        VR::IS,
        PrimitiveValue::from(frames.to_string()),
    );
    if let Some((slope, intercept)) = rescale {
        put(&mut obj, tags::RESCALE_SLOPE, VR::DS, PrimitiveValue::from(slope));
        put(&mut obj, tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from(intercept));
    }
    let pixel_vr = if bits == 8 { VR::OB } else { VR::OW };
    put(&mut obj, tags::PIXEL_DATA, pixel_vr, PrimitiveValue::from(pixels));

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(SOP_CLASS)
        .media_storage_sop_instance_uid(SOP_INSTANCE)
        .build()
        .expect("meta");

    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    file_obj.write_to_file(path).expect("write test dicom");
}

/// Two 32x32 16-bit frames holding `frame * 1024 + row * 32 + column`, rescaled by -1024.
fn build_ct_dicom() -> (TempDir, PathBuf) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("chest.dcm");
    let bytes: Vec<u8> = (0..2 * 32 * 32)
        .flat_map(|v: u16| v.to_le_bytes())
        .collect();
    write_dicom(
        &path,
        DicomFixture {
            rows: 32,
            columns: 32,
            frames: 2,
            bits: 16,
            pixels: bytes,
            with_identifiers: true,
            rescale: Some(("1", "-1024")),
        },
    );
    (dir, path)
}

/// A single 32x32 8-bit frame without identifiers or rescale.
fn build_plain_dicom() -> (TempDir, PathBuf) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("capture.dcm");
    let bytes: Vec<u8> = (0..32 * 32).map(|i| (i % 251) as u8).collect();
    write_dicom(
        &path,
        DicomFixture {
            rows: 32,
            columns: 32,
            frames: 1,
            bits: 8,
            pixels: bytes,
            with_identifiers: false,
            rescale: None,
        },
    );
    (dir, path)
}

fn ramp_volume() -> Array3<f32> {
    Array3::from_shape_fn((16, 16, 8), |(x, y, z)| (x + 16 * y + 256 * z) as f32)
}

fn write_nifti(dir: &Path, name: &str, data: &Array3<f32>) -> PathBuf {
    let path = dir.join(name);
    WriterOptions::new(&path)
        .write_nifti(data)
        .expect("write nifti");
    path
}

fn gzip(path: &Path) -> PathBuf {
    let gz = PathBuf::from(format!("{}.gz", path.display()));
    let mut encoder = GzEncoder::new(fs::File::create(&gz).expect("create gz"), Compression::default());
    encoder
        .write_all(&fs::read(path).expect("read nifti"))
        .expect("compress");
    encoder.finish().expect("finish gz");
    gz
}

fn truncated_copy(path: &Path, name: &str, keep: usize) -> PathBuf {
    let bytes = fs::read(path).expect("read");
    let out = path.with_file_name(name);
    fs::write(&out, &bytes[..keep.min(bytes.len())]).expect("write truncated");
    out
}

fn mock_pipeline(processed: &Path) -> Pipeline {
    let tool = SubprocessTool::with_availability("TotalSegmentator", false);
    Pipeline::new(
        MedicalFileValidator::default(),
        SegmentationOrchestrator::new(tool, &SegmentationConfig::default()),
        None,
        processed,
    )
}

fn expect_valid(verdict: ValidationVerdict) -> medimg_pipeline::models::ValidFile {
    match verdict {
        ValidationVerdict::Valid(valid) => valid,
        ValidationVerdict::Invalid { reason } => panic!("expected valid file, got: {reason}"),
    }
}

fn expect_invalid(verdict: ValidationVerdict) -> String {
    match verdict {
        ValidationVerdict::Invalid { reason } => reason,
        ValidationVerdict::Valid(valid) => panic!("expected invalid file, got {valid:?}"),
    }
}

#[test]
fn dicom_fixture_validates_and_decodes_with_rescale() {
    let (_dir, path) = build_ct_dicom();

    let valid = expect_valid(MedicalFileValidator::default().validate(&path));
    assert_eq!(valid.format, MedicalFormat::Dicom);
    assert_eq!(valid.modality, "CT");
    assert_eq!(valid.dimensions, vec![32, 32, 2]);
    assert_eq!(valid.identifiers.patient_id.as_deref(), Some("PAT123"));
    assert!(valid.warnings.is_empty());

    let asset = decode::decode(&path).expect("decode");
    assert_eq!(asset.shape, vec![32, 32, 2]);
    assert_eq!(asset.element_type, "uint16");
    assert_eq!(asset.volume.depth(), 2);

    let summary = stats::summarize_asset(&asset);
    assert!(summary.has_data);
    assert_eq!(summary.total_voxels, 2048);
    assert!((summary.min - -1024.0).abs() < 1e-6);
    assert!((summary.max - 1023.0).abs() < 1e-6);
    assert!((summary.mean - -0.5).abs() < 1e-6);
    assert_eq!(summary.non_zero_count, 2047);

    let info = decode::describe(&asset);
    assert_eq!(info.slices, 2);
}

#[test]
fn dicom_without_preamble_validates_and_decodes() {
    let (_dir, path) = build_ct_dicom();
    let bytes = fs::read(&path).expect("read");
    assert_eq!(&bytes[128..132], b"DICM");

    let bare = path.with_file_name("no_preamble.dcm");
    fs::write(&bare, &bytes[128..]).expect("write");
    let unnamed = path.with_file_name("no_preamble");
    fs::write(&unnamed, &bytes[128..]).expect("write");
    assert_eq!(format::detect_with_content(&unnamed), MedicalFormat::Dicom);

    for candidate in [&bare, &unnamed] {
        let valid = expect_valid(MedicalFileValidator::default().validate(candidate));
        assert_eq!(valid.modality, "CT");
        assert_eq!(valid.dimensions, vec![32, 32, 2]);

        let asset = decode::decode(candidate).expect("decode");
        let summary = stats::summarize_asset(&asset);
        assert!((summary.min - -1024.0).abs() < 1e-6);
        assert!((summary.max - 1023.0).abs() < 1e-6);
    }
}

#[test]
fn eight_bit_dicom_passes_through_and_warns_about_identifiers() {
    let (_dir, path) = build_plain_dicom();

    let valid = expect_valid(MedicalFileValidator::default().validate(&path));
    assert_eq!(valid.modality, "UNKNOWN");
    assert_eq!(valid.dimensions, vec![32, 32]);
    assert_eq!(valid.warnings.len(), 1);
    assert!(valid.warnings[0].contains("PatientID"));
    assert!(valid.warnings[0].contains("SeriesInstanceUID"));

    let asset = decode::decode(&path).expect("decode");
    let VoxelData::U8(raw) = &asset.volume.voxels else {
        panic!("8-bit data should stay 8-bit");
    };
    let rendered = image::normalize(&asset.volume.voxels);
    assert_eq!(&rendered, raw);
}

#[test]
fn corrupted_and_truncated_dicom_are_invalid() {
    let (_dir, path) = build_ct_dicom();
    let size = fs::metadata(&path).expect("meta").len() as usize;

    let truncated = truncated_copy(&path, "truncated.dcm", size / 2);
    assert!(!expect_invalid(MedicalFileValidator::default().validate(&truncated)).is_empty());

    let header_only = truncated_copy(&path, "header.dcm", 140);
    assert!(!expect_invalid(MedicalFileValidator::default().validate(&header_only)).is_empty());

    let mut bytes = fs::read(&path).expect("read");
    for b in bytes.iter_mut().take(512) {
        *b = 0xAB;
    }
    let garbled = path.with_file_name("garbled.dcm");
    fs::write(&garbled, bytes).expect("write");
    assert!(!expect_invalid(MedicalFileValidator::default().validate(&garbled)).is_empty());
}

#[test]
fn nifti_fixtures_validate_plain_and_gzipped() {
    let dir = tempdir().expect("tempdir");
    let plain = write_nifti(dir.path(), "brain.nii", &ramp_volume());
    let gz = gzip(&plain);

    assert_eq!(format::detect(&gz), MedicalFormat::Nifti);
    assert_eq!(format::base_name("brain.nii.gz"), "brain");

    for path in [&plain, &gz] {
        let valid = expect_valid(MedicalFileValidator::default().validate(path));
        assert_eq!(valid.format, MedicalFormat::Nifti);
        assert_eq!(valid.modality, "MRI");
        assert_eq!(valid.dimensions, vec![16, 16, 8]);
        assert_eq!(valid.voxel_sizes.as_ref().map(Vec::len), Some(3));

        let asset = decode::decode(path).expect("decode");
        assert_eq!(asset.shape, vec![16, 16, 8]);
        let summary = stats::summarize_asset(&asset);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.max, 2047.0);
        assert_eq!(summary.total_voxels, 2048);
    }
}

#[test]
fn constant_and_truncated_nifti_are_invalid() {
    let dir = tempdir().expect("tempdir");
    let flat = write_nifti(dir.path(), "flat.nii", &Array3::from_elem((8, 8, 4), 3.0_f32));
    let reason = expect_invalid(MedicalFileValidator::default().validate(&flat));
    assert!(reason.contains("no variation"));

    let ramp = write_nifti(dir.path(), "ramp.nii", &ramp_volume());
    let truncated = truncated_copy(&ramp, "cut.nii", 1000);
    assert!(!expect_invalid(MedicalFileValidator::default().validate(&truncated)).is_empty());

    let junk = dir.path().join("junk.nii.gz");
    fs::write(&junk, vec![0x42; 4096]).expect("write junk");
    assert!(!expect_invalid(MedicalFileValidator::default().validate(&junk)).is_empty());
}

#[test]
fn previews_clamp_slices_and_write_png_files() {
    let dir = tempdir().expect("tempdir");
    let path = write_nifti(dir.path(), "ramp.nii", &ramp_volume());
    let asset = decode::decode(&path).expect("decode");
    let out = dir.path().join("previews");
    fs::create_dir_all(&out).expect("mkdir");

    let (index, png) = image::preview_png_bytes(&asset, Some(-1)).expect("preview");
    assert_eq!(index, 0);
    assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

    let last = image::prepare_for_web(&asset, &out, Some(100)).expect("web preview");
    assert_eq!(last.file_name().and_then(|n| n.to_str()), Some("ramp_slice_7_web.png"));
    let middle = image::prepare_for_web(&asset, &out, None).expect("web preview");
    assert_eq!(middle.file_name().and_then(|n| n.to_str()), Some("ramp_slice_4_web.png"));

    let slices = image::write_even_slices(&asset, &out, 3).expect("slices");
    assert_eq!(slices.len(), 3);
    assert!(slices[2].ends_with("ramp_slice_3.png"));
    for slice in &slices {
        let bytes = fs::read(slice).expect("read png");
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }
}

#[tokio::test]
async fn study_processing_uses_mock_segmentation_without_the_tool() {
    let dir = tempdir().expect("tempdir");
    let path = write_nifti(dir.path(), "abdomen.nii", &ramp_volume());
    let pipeline = mock_pipeline(&dir.path().join("processed"));

    let valid = pipeline.ingest(&path).expect("ingest");
    assert_eq!(valid.dimensions, vec![16, 16, 8]);

    let mut lifecycle = StudyLifecycle::new();
    let report = pipeline
        .process(&mut lifecycle, &path, &ProcessRequest::default())
        .await
        .expect("process");

    assert_eq!(lifecycle.status(), StudyStatus::Completed);
    assert!(report.segmentation.is_mock);
    assert_eq!(report.segmentation.task, "total");
    assert_eq!(report.segmentation.manifest.segmented_organs, MOCK_ORGANS.to_vec());
    assert!(report.segmentation.manifest.output_directory.is_dir());
    assert!(matches!(report.analysis, Some(AnalysisOutcome::Skipped { .. })));
    assert!(report.preview.as_ref().is_some_and(|p| p.is_file()));
    assert_eq!(report.image.shape, vec![16, 16, 8]);

    let again = pipeline
        .process(&mut lifecycle, &path, &ProcessRequest::default())
        .await
        .expect_err("terminal");
    assert!(matches!(again, PipelineError::Lifecycle(_)));
}

#[tokio::test]
async fn rejected_upload_is_removed_by_ingest() {
    let dir = tempdir().expect("tempdir");
    let flat = write_nifti(dir.path(), "flat.nii", &Array3::from_elem((8, 8, 4), 1.0_f32));
    let pipeline = mock_pipeline(&dir.path().join("processed"));

    let err = pipeline.ingest(&flat).expect_err("rejected");
    assert!(matches!(err, PipelineError::Validation { ref reason } if reason.contains("no variation")));
    assert!(!flat.exists());
}
