//
// image.rs
// MedImg-Pipeline
//
// Maps decoded voxels to 8-bit display rasters: percentile clipping, slice selection and PNG export.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use ndarray::{ArrayD, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{RenderError, ResourceError};
use crate::format;
use crate::models::{ImageAsset, Volume, VoxelData};
use crate::stats;

const LOWER_CLIP_PERCENTILE: f64 = 1.0;
const UPPER_CLIP_PERCENTILE: f64 = 99.0;

/// Map values to `[0, 255]` after clipping to the 1st/99th percentile.
///
/// 8-bit input is returned unchanged. A flat input (equal percentiles) maps to all zeros, and
/// NaN voxels render as 0.
pub fn normalize(data: &VoxelData) -> ArrayD<u8> {
    match data {
        VoxelData::U8(a) => a.clone(),
        VoxelData::F32(a) => normalize_f32(a),
    }
}

fn normalize_f32(data: &ArrayD<f32>) -> ArrayD<u8> {
    let bounds = stats::percentiles(
        data.iter().map(|&v| v as f64),
        &[LOWER_CLIP_PERCENTILE, UPPER_CLIP_PERCENTILE],
    );
    let (lo, hi) = (bounds[0], bounds[1]);
    // Also catches NaN bounds.
    if !(hi > lo) {
        return ArrayD::zeros(data.raw_dim());
    }

    let range = hi - lo;
    data.mapv(|v| {
        let v = v as f64;
        if v.is_nan() {
            0
        } else {
            ((v.clamp(lo, hi) - lo) / range * 255.0) as u8
        }
    })
}

/// A 2-D (or 2-D plus channels) cut through a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSelection {
    pub index: usize,
    pub depth: usize,
    pub data: VoxelData,
}

fn take_index(data: &VoxelData, axis: usize, index: usize) -> VoxelData {
    match data {
        VoxelData::U8(a) => VoxelData::U8(a.index_axis(Axis(axis), index).to_owned()),
        VoxelData::F32(a) => VoxelData::F32(a.index_axis(Axis(axis), index).to_owned()),
    }
}

/// Clamp a requested slice index into `[0, depth - 1]`; `None` picks the middle slice.
pub fn clamp_slice_index(depth: usize, requested: Option<i64>) -> usize {
    if depth == 0 {
        return 0;
    }
    match requested {
        None => depth / 2,
        Some(idx) => idx.clamp(0, depth as i64 - 1) as usize,
    }
}

/// Pick one slice along the depth axis. Planar images ignore the request and report index 0;
/// 4-D volumes are cut from their first volume.
pub fn select_slice(volume: &Volume, requested: Option<i64>) -> SliceSelection {
    let mut data = volume.voxels.clone();
    let mut spatial = volume.spatial_ndim();

    while spatial > 3 {
        data = take_index(&data, 3, 0);
        spatial -= 1;
    }

    if spatial < 3 {
        return SliceSelection {
            index: 0,
            depth: 1,
            data,
        };
    }

    let depth = data.shape()[2];
    let index = clamp_slice_index(depth, requested);
    SliceSelection {
        index,
        depth,
        data: take_index(&data, 2, index),
    }
}

/// `min(count, depth)` indices spread evenly over `[0, depth - 1]`, rounded to integers.
pub fn even_slice_indices(depth: usize, count: usize) -> Vec<usize> {
    let n = count.min(depth);
    match n {
        0 => Vec::new(),
        1 => vec![0],
        _ => {
            let step = (depth - 1) as f64 / (n - 1) as f64;
            (0..n).map(|i| (i as f64 * step).round() as usize).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSlice {
    pub index: usize,
    pub raster: ArrayD<u8>,
}

/// Evenly spaced slices, each normalized independently.
pub fn extract_even_slices(volume: &Volume, count: usize) -> Vec<RenderedSlice> {
    even_slice_indices(volume.depth(), count)
        .into_par_iter()
        .map(|index| {
            let selection = select_slice(volume, Some(index as i64));
            RenderedSlice {
                index: selection.index,
                raster: normalize(&selection.data),
            }
        })
        .collect()
}

/// Encode a `(rows, columns)` grayscale or `(rows, columns, 3|4)` colour raster as PNG.
pub fn encode_png(raster: &ArrayD<u8>) -> Result<Vec<u8>, RenderError> {
    let shape = raster.shape().to_vec();
    let bytes: Vec<u8> = raster.as_standard_layout().iter().copied().collect();
    let layout_error = || RenderError::Layout(shape.clone());

    let image = match shape.as_slice() {
        [h, w] => GrayImage::from_raw(*w as u32, *h as u32, bytes).map(DynamicImage::ImageLuma8),
        [h, w, 3] => RgbImage::from_raw(*w as u32, *h as u32, bytes).map(DynamicImage::ImageRgb8),
        [h, w, 4] => RgbaImage::from_raw(*w as u32, *h as u32, bytes).map(DynamicImage::ImageRgba8),
        _ => None,
    }
    .ok_or_else(layout_error)?;

    encode_image(&image, ImageFormat::Png)
}

fn encode_image(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, RenderError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), format)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(buffer)
}

fn write_png(raster: &ArrayD<u8>, path: &Path) -> Result<(), RenderError> {
    let bytes = encode_png(raster)?;
    fs::write(path, bytes).map_err(|source| ResourceError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn asset_base_name(asset: &ImageAsset) -> String {
    asset
        .path
        .file_name()
        .map(|n| format::base_name(&n.to_string_lossy()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

/// Render one slice to PNG bytes, returning the slice index actually used.
pub fn preview_png_bytes(
    asset: &ImageAsset,
    requested: Option<i64>,
) -> Result<(usize, Vec<u8>), RenderError> {
    let selection = select_slice(&asset.volume, requested);
    let png = encode_png(&normalize(&selection.data))?;
    Ok((selection.index, png))
}

/// Write a browser-viewable PNG of one slice next to the other derived files.
/// Slice 0 (and planar images) use `<base>_web.png`; other slices `<base>_slice_<i>_web.png`.
pub fn prepare_for_web(
    asset: &ImageAsset,
    output_dir: &Path,
    requested: Option<i64>,
) -> Result<PathBuf, RenderError> {
    let selection = select_slice(&asset.volume, requested);
    let base = asset_base_name(asset);
    let name = if selection.index > 0 {
        format!("{}_slice_{}_web.png", base, selection.index)
    } else {
        format!("{}_web.png", base)
    };
    let path = output_dir.join(name);

    write_png(&normalize(&selection.data), &path)?;
    debug!(?path, slice = selection.index, depth = selection.depth, "wrote web preview");
    Ok(path)
}

/// Write `count` evenly spaced slices as `<base>_slice_<n>.png` (n starting at 1).
pub fn write_even_slices(
    asset: &ImageAsset,
    output_dir: &Path,
    count: usize,
) -> Result<Vec<PathBuf>, RenderError> {
    let base = asset_base_name(asset);
    fs::create_dir_all(output_dir).map_err(|source| ResourceError::CreateDir {
        path: output_dir.to_path_buf(),
        source,
    })?;

    extract_even_slices(&asset.volume, count)
        .iter()
        .enumerate()
        .map(|(i, slice)| {
            let path = output_dir.join(format!("{}_slice_{}.png", base, i + 1));
            write_png(&slice.raster, &path)?;
            Ok(path)
        })
        .collect()
}
