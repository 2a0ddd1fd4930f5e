//! Waveform comparison for one sensor: normalization, smoothing, a
//! length-normalized Euclidean distance on a common grid, and band-limited
//! dynamic time warping. Pure computation; callers decide what a distance
//! means.

pub const REASON_EMPTY: &str = "empty_series";
pub const REASON_NON_FINITE: &str = "non_finite_series";
pub const REASON_LOW_VARIANCE: &str = "low_variance_reference";

const VARIANCE_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceOutput {
    pub euclidean_distance: f64,
    pub dtw_distance: f64,
    pub max_abs_deviation: f64,
    pub mean_abs_deviation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DistanceOutcome {
    Computed(DistanceOutput),
    /// Degenerate input; callers exclude the sensor from ranking instead of
    /// reading this as zero deviation.
    NotComputable { reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct DistanceParams {
    pub smoothing_window: usize,
    pub dtw_band_fraction: f64,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            smoothing_window: 5,
            dtw_band_fraction: 0.10,
        }
    }
}

/// Compares a candidate series against a reference series.
///
/// Both series are z-normalized against the reference's mean and standard
/// deviation, then smoothed with the same centered moving-average window.
/// Because the reference's statistics set the scale, swapping the arguments
/// changes the normalization; the distances are symmetric exactly when both
/// series share mean and standard deviation.
pub fn compare_series(
    reference: &[f64],
    candidate: &[f64],
    params: &DistanceParams,
) -> DistanceOutcome {
    let had_reference = !reference.is_empty();
    let had_candidate = !candidate.is_empty();
    let reference: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
    let candidate: Vec<f64> = candidate.iter().copied().filter(|v| v.is_finite()).collect();

    if reference.is_empty() || candidate.is_empty() {
        let reason = if had_reference || had_candidate {
            REASON_NON_FINITE
        } else {
            REASON_EMPTY
        };
        return DistanceOutcome::NotComputable { reason };
    }

    let (mean, std) = mean_std(&reference);
    if std * std < VARIANCE_EPS {
        return DistanceOutcome::NotComputable {
            reason: REASON_LOW_VARIANCE,
        };
    }

    let znorm = |series: &[f64]| -> Vec<f64> {
        series.iter().map(|v| (v - mean) / std).collect()
    };
    let reference = smooth(&znorm(&reference), params.smoothing_window);
    let candidate = smooth(&znorm(&candidate), params.smoothing_window);

    let grid_len = reference.len().max(candidate.len());
    let ref_grid = resample(&reference, grid_len);
    let cand_grid = resample(&candidate, grid_len);

    let mut sum_sq = 0.0f64;
    let mut sum_abs = 0.0f64;
    let mut max_abs = 0.0f64;
    for (a, b) in ref_grid.iter().zip(cand_grid.iter()) {
        let diff = b - a;
        sum_sq += diff * diff;
        sum_abs += diff.abs();
        if diff.abs() > max_abs {
            max_abs = diff.abs();
        }
    }
    let euclidean_distance = (sum_sq / grid_len as f64).sqrt();
    let mean_abs_deviation = sum_abs / grid_len as f64;

    let dtw_distance = dtw_banded(&reference, &candidate, params.dtw_band_fraction);

    DistanceOutcome::Computed(DistanceOutput {
        euclidean_distance,
        dtw_distance,
        max_abs_deviation: max_abs,
        mean_abs_deviation,
    })
}

fn mean_std(series: &[f64]) -> (f64, f64) {
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let var = series.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Centered moving average; window is clamped near the edges so the output
/// has the same length as the input.
fn smooth(series: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || series.len() < 3 {
        return series.to_vec();
    }
    let half = window / 2;
    let n = series.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        let slice = &series[lo..hi];
        out.push(slice.iter().sum::<f64>() / slice.len() as f64);
    }
    out
}

/// Linear interpolation onto a grid of `len` evenly spaced points spanning
/// the series' index range.
fn resample(series: &[f64], len: usize) -> Vec<f64> {
    let n = series.len();
    if n == len {
        return series.to_vec();
    }
    if n == 1 {
        return vec![series[0]; len];
    }
    let mut out = Vec::with_capacity(len);
    let scale = (n - 1) as f64 / (len - 1).max(1) as f64;
    for i in 0..len {
        let pos = i as f64 * scale;
        let idx = pos.floor() as usize;
        if idx + 1 >= n {
            out.push(series[n - 1]);
        } else {
            let frac = pos - idx as f64;
            out.push(series[idx] * (1.0 - frac) + series[idx + 1] * frac);
        }
    }
    out
}

/// Sakoe-Chiba banded DTW with squared-difference step cost. The band is at
/// least |n - m| wide so a path always exists; the minimal cost is divided
/// by n + m so series of differing duration stay comparable.
fn dtw_banded(a: &[f64], b: &[f64], band_fraction: f64) -> f64 {
    let n = a.len();
    let m = b.len();
    let longer = n.max(m);
    let band = ((band_fraction * longer as f64).ceil() as usize)
        .max(n.abs_diff(m))
        .max(1);

    let mut prev = vec![f64::INFINITY; m + 1];
    let mut row = vec![f64::INFINITY; m + 1];
    prev[0] = 0.0;

    for i in 1..=n {
        row.fill(f64::INFINITY);
        // Row i may only visit columns within the band around the diagonal.
        let center = i * m / n;
        let lo = center.saturating_sub(band).max(1);
        let hi = (center + band).min(m);
        for j in lo..=hi {
            let diff = a[i - 1] - b[j - 1];
            let cost = diff * diff;
            let best = prev[j].min(prev[j - 1]).min(row[j - 1]);
            row[j] = cost + best;
        }
        std::mem::swap(&mut prev, &mut row);
    }

    let total = prev[m];
    if total.is_finite() {
        total / (n + m) as f64
    } else {
        // Band too tight for a path; should not happen with the |n-m| floor.
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DistanceParams {
        DistanceParams::default()
    }

    fn computed(outcome: DistanceOutcome) -> DistanceOutput {
        match outcome {
            DistanceOutcome::Computed(out) => out,
            DistanceOutcome::NotComputable { reason } => {
                panic!("expected computable outcome, got {reason}")
            }
        }
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 50.0 + 10.0 * (i as f64 * 0.1).sin())
            .collect()
    }

    #[test]
    fn identical_series_have_zero_distance() {
        let series = wave(120);
        let out = computed(compare_series(&series, &series, &params()));
        assert!(out.euclidean_distance.abs() < 1e-9);
        assert!(out.dtw_distance.abs() < 1e-9);
        assert!(out.max_abs_deviation.abs() < 1e-9);
    }

    #[test]
    fn symmetric_for_series_with_equal_stats() {
        // Same values, shifted phase: identical mean/std, so swapping the
        // roles normalizes by the same statistics.
        let a = wave(200);
        let mut b = a.clone();
        b.rotate_left(50);

        let ab = computed(compare_series(&a, &b, &params()));
        let ba = computed(compare_series(&b, &a, &params()));
        assert!((ab.euclidean_distance - ba.euclidean_distance).abs() < 1e-9);
        assert!((ab.dtw_distance - ba.dtw_distance).abs() < 1e-9);
    }

    #[test]
    fn empty_and_all_nan_are_not_computable() {
        assert_eq!(
            compare_series(&[], &[], &params()),
            DistanceOutcome::NotComputable {
                reason: REASON_EMPTY
            }
        );
        let nans = vec![f64::NAN; 10];
        assert_eq!(
            compare_series(&wave(10), &nans, &params()),
            DistanceOutcome::NotComputable {
                reason: REASON_NON_FINITE
            }
        );
    }

    #[test]
    fn constant_reference_is_flagged_low_variance() {
        let flat = vec![65.0; 50];
        assert_eq!(
            compare_series(&flat, &wave(50), &params()),
            DistanceOutcome::NotComputable {
                reason: REASON_LOW_VARIANCE
            }
        );
    }

    #[test]
    fn spike_in_final_third_raises_both_metrics() {
        let reference = wave(150);
        let mut spiked = reference.clone();
        for v in spiked.iter_mut().skip(100) {
            *v += 25.0;
        }
        let baseline = computed(compare_series(&reference, &reference, &params()));
        let deviant = computed(compare_series(&reference, &spiked, &params()));
        assert!(deviant.euclidean_distance > baseline.euclidean_distance + 0.5);
        assert!(deviant.dtw_distance > baseline.dtw_distance);
        assert!(deviant.max_abs_deviation > 1.0);
    }

    #[test]
    fn differing_lengths_stay_comparable() {
        // The same underlying shape sampled at different rates should stay
        // close after resampling and length normalization.
        let coarse: Vec<f64> = (0..100)
            .map(|i| 50.0 + 10.0 * (i as f64 * 0.1).sin())
            .collect();
        let fine: Vec<f64> = (0..200)
            .map(|i| 50.0 + 10.0 * (i as f64 * 0.05).sin())
            .collect();
        let out = computed(compare_series(&coarse, &fine, &params()));
        assert!(out.euclidean_distance < 0.5, "{}", out.euclidean_distance);
    }

    #[test]
    fn dtw_tolerates_small_time_shift_better_than_euclidean() {
        let reference = wave(200);
        let shifted: Vec<f64> = (0..200)
            .map(|i| 50.0 + 10.0 * ((i as f64 + 8.0) * 0.1).sin())
            .collect();
        let out = computed(compare_series(&reference, &shifted, &params()));
        // Warping absorbs an 8-step shift inside the 20-step band.
        assert!(out.dtw_distance < out.euclidean_distance);
    }
}
