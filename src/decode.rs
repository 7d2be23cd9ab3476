//
// decode.rs
// MedImg-Pipeline
//
// Fully decodes DICOM and NIFTI files into immutable image assets with their spatial metadata.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::Path;

use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use dicom_pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, PixelRepresentation};
use ndarray::{Array4, ArrayD, Axis};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, NiftiVolume, ReaderOptions};
use tracing::debug;

use crate::error::DecodeError;
use crate::format::{self, MedicalFormat};
use crate::metadata;
use crate::models::{
    FormatMetadata, ImageAsset, ImageInfo, SpatialMetadata, Volume, VoxelData,
};
use crate::stats;

/// Decode any supported file. The format is taken from the suffix, falling back to content.
pub fn decode(path: &Path) -> Result<ImageAsset, DecodeError> {
    match format::detect_with_content(path) {
        MedicalFormat::Dicom => decode_dicom(path),
        MedicalFormat::Nifti => decode_nifti(path),
        MedicalFormat::Unknown => Err(DecodeError::UnsupportedFormat(format::extension(path))),
    }
}

/// Open a DICOM file without requiring the 128-byte preamble.
pub fn open_dicom(path: &Path) -> Result<DefaultDicomObject, DecodeError> {
    OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .open_file(path)
        .map_err(|e| DecodeError::Dicom(e.to_string()))
}

pub fn decode_dicom(path: &Path) -> Result<ImageAsset, DecodeError> {
    let obj = open_dicom(path)?;
    let dicom_meta = metadata::extract_dicom_metadata(&obj);
    let (identifiers, _) = metadata::dicom_identifiers(&obj);

    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| DecodeError::Dicom(format!("cannot read pixel data: {e}")))?;
    if decoded.rows() == 0 || decoded.columns() == 0 {
        return Err(DecodeError::Layout(format!(
            "{}x{} pixel matrix",
            decoded.rows(),
            decoded.columns()
        )));
    }

    let unsigned = decoded.pixel_representation() == PixelRepresentation::Unsigned;
    let bits_allocated = decoded.bits_allocated();
    let channels = decoded.samples_per_pixel() as usize;

    // 8-bit data without a modality LUT is kept raw so display can pass it straight through.
    let voxels = if bits_allocated == 8 && unsigned && !dicom_meta.has_rescale() {
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
        let arr = decoded
            .to_ndarray_with_options::<u8>(&options)
            .map_err(|e| DecodeError::Dicom(e.to_string()))?;
        VoxelData::U8(arrange_dicom_axes(arr))
    } else {
        let arr = decoded
            .to_ndarray::<f32>()
            .map_err(|e| DecodeError::Dicom(e.to_string()))?;
        VoxelData::F32(arrange_dicom_axes(arr))
    };

    let element_type = format!(
        "{}int{}",
        if unsigned { "u" } else { "" },
        bits_allocated
    );
    debug!(?path, shape = ?voxels.shape(), %element_type, "decoded DICOM");

    Ok(ImageAsset {
        path: path.to_path_buf(),
        format: MedicalFormat::Dicom,
        shape: voxels.shape().to_vec(),
        element_type,
        spatial: metadata::dicom_spatial(&obj),
        modality: metadata::dicom_modality(&obj),
        identifiers,
        metadata: FormatMetadata::Dicom(dicom_meta),
        volume: Volume::with_channels(voxels, channels),
    })
}

/// Rearrange `(frames, rows, columns, samples)` into `(rows, columns[, frames][, samples])`,
/// dropping singleton frame and sample axes.
fn arrange_dicom_axes<T: Clone>(arr: Array4<T>) -> ArrayD<T> {
    let (frames, _, _, samples) = arr.dim();
    let arr = arr.permuted_axes([1, 2, 0, 3]).into_dyn();
    let arr = if samples == 1 {
        arr.index_axis_move(Axis(3), 0)
    } else {
        arr
    };
    let arr = if frames == 1 {
        arr.index_axis_move(Axis(2), 0)
    } else {
        arr
    };
    arr.as_standard_layout().into_owned()
}

/// Read a NIFTI header and volume; `.nii.gz` is decompressed transparently.
pub fn read_nifti(path: &Path) -> Result<(NiftiHeader, NiftiType, VoxelData), DecodeError> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| DecodeError::Nifti(e.to_string()))?;
    let header = obj.header().clone();
    let volume = obj.into_volume();
    let data_type = volume.data_type();

    let unscaled = (header.scl_slope == 0.0 || header.scl_slope == 1.0) && header.scl_inter == 0.0;
    let voxels = if data_type == NiftiType::Uint8 && unscaled {
        VoxelData::U8(
            volume
                .into_ndarray::<u8>()
                .map_err(|e| DecodeError::Nifti(e.to_string()))?,
        )
    } else {
        VoxelData::F32(
            volume
                .into_ndarray::<f32>()
                .map_err(|e| DecodeError::Nifti(e.to_string()))?,
        )
    };
    Ok((header, data_type, voxels))
}

pub fn nifti_type_name(data_type: NiftiType) -> String {
    format!("{:?}", data_type).to_lowercase()
}

pub fn decode_nifti(path: &Path) -> Result<ImageAsset, DecodeError> {
    let (header, data_type, voxels) = read_nifti(path)?;
    let ndim = voxels.shape().len();
    let element_type = nifti_type_name(data_type);
    debug!(?path, shape = ?voxels.shape(), %element_type, "decoded NIFTI");

    Ok(ImageAsset {
        path: path.to_path_buf(),
        format: MedicalFormat::Nifti,
        shape: voxels.shape().to_vec(),
        element_type: element_type.clone(),
        spatial: SpatialMetadata {
            spacing: metadata::nifti_voxel_size(&header, ndim),
            orientation: None,
            position: None,
            affine: Some(metadata::nifti_affine(&header)),
        },
        modality: None,
        identifiers: Default::default(),
        metadata: FormatMetadata::Nifti(metadata::extract_nifti_metadata(
            &header,
            ndim,
            element_type,
        )),
        volume: Volume::new(voxels),
    })
}

/// Serializable description of an asset, statistics included.
pub fn describe(asset: &ImageAsset) -> ImageInfo {
    ImageInfo {
        path: asset.path.clone(),
        format: asset.format,
        shape: asset.shape.clone(),
        element_type: asset.element_type.clone(),
        modality: asset.modality.clone(),
        identifiers: asset.identifiers.clone(),
        spatial: asset.spatial.clone(),
        metadata: asset.metadata.clone(),
        statistics: stats::summarize_asset(asset),
        slices: asset.volume.depth(),
    }
}
