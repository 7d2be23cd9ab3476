use crate::models::{ImageAsset, StatisticalSummary, VoxelData};

/// Summarize decoded voxels, ignoring NaNs.
pub fn summarize(data: &VoxelData) -> StatisticalSummary {
    summarize_values(data.values())
}

pub fn summarize_asset(asset: &ImageAsset) -> StatisticalSummary {
    summarize(&asset.volume.voxels)
}

/// Summary over an arbitrary stream of samples. NaNs are dropped before anything is computed;
/// an empty remainder yields the all-zero summary with `has_data == false`.
pub fn summarize_values(values: impl IntoIterator<Item = f64>) -> StatisticalSummary {
    let mut clean: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if clean.is_empty() {
        return StatisticalSummary::default();
    }

    let count = clean.len() as f64;
    let sum: f64 = clean.iter().sum();
    let mean = sum / count;
    let variance = clean
        .iter()
        .map(|x| {
            let diff = mean - x;
            diff * diff
        })
        .sum::<f64>()
        / count;
    let non_zero_count = clean.iter().filter(|&&v| v != 0.0).count();

    clean.sort_by(f64::total_cmp);

    StatisticalSummary {
        min: clean[0],
        max: clean[clean.len() - 1],
        mean,
        std: variance.sqrt(),
        median: percentile_sorted(&clean, 50.0),
        percentile_5: percentile_sorted(&clean, 5.0),
        percentile_95: percentile_sorted(&clean, 95.0),
        non_zero_count,
        total_voxels: clean.len(),
        has_data: true,
    }
}

/// Percentile of already-sorted, NaN-free data with linear interpolation between order
/// statistics. `p` is in `[0, 100]`. Returns 0 for empty input.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Several percentiles of unsorted data, NaNs excluded.
pub fn percentiles(values: impl IntoIterator<Item = f64>, ps: &[f64]) -> Vec<f64> {
    let mut clean: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    clean.sort_by(f64::total_cmp);
    ps.iter().map(|&p| percentile_sorted(&clean, p)).collect()
}
