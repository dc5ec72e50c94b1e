use crate::core::cloud_mask::cloud_mask;
use crate::types::{CalError, CalResult, RasterStack};
use ndarray::{s, Array2, Array3, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Temporal stability parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityParams {
    /// A band is stable where its temporal std is strictly below this value
    pub std_threshold: f32,
    /// Minimum number of clear observations for a pixel to be judged at all
    pub min_valid_dates: usize,
}

impl Default for StabilityParams {
    fn default() -> Self {
        Self {
            std_threshold: 0.01,
            min_valid_dates: 1,
        }
    }
}

/// Outcome of the temporal stability filter
#[derive(Debug, Clone)]
pub struct StabilityResult {
    /// Population std per (band, row, col); NaN where too few observations
    pub band_std: Array3<f32>,
    /// Number of clear observations per (row, col)
    pub valid_count: Array2<u32>,
    /// True where every band is stable
    pub stable: Array2<bool>,
}

impl StabilityResult {
    pub fn stable_count(&self) -> usize {
        self.stable.iter().filter(|&&v| v).count()
    }
}

/// Population standard deviation (ddof = 0) and sample count of the finite values
pub fn masked_std<I>(values: I) -> (Option<f64>, usize)
where
    I: IntoIterator<Item = (f32, bool)>,
{
    // Welford's online update
    let mut n = 0usize;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    for (v, valid) in values {
        if !valid || !v.is_finite() {
            continue;
        }
        n += 1;
        let x = v as f64;
        let delta = x - mean;
        mean += delta / n as f64;
        m2 += delta * (x - mean);
    }
    if n == 0 {
        (None, 0)
    } else {
        (Some((m2 / n as f64).max(0.0).sqrt()), n)
    }
}

/// Flags pixels whose cloud-masked reflectance stays flat over the time series
pub struct StabilityFilter {
    params: StabilityParams,
}

impl StabilityFilter {
    /// Create a new stability filter with default parameters
    pub fn new() -> Self {
        Self {
            params: StabilityParams::default(),
        }
    }

    /// Create a stability filter with custom parameters
    pub fn with_params(params: StabilityParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StabilityParams {
        &self.params
    }

    /// Apply the filter to a loaded stack, deriving the cloud mask from its
    /// scene classification codes
    pub fn apply(&self, stack: &RasterStack) -> CalResult<StabilityResult> {
        let valid = cloud_mask(&stack.classification);
        self.apply_masked(stack.reflectance.view(), valid.view())
    }

    /// Apply the filter to a (time, band, row, col) cube and a (time, row, col) mask
    pub fn apply_masked(
        &self,
        reflectance: ArrayView4<f32>,
        valid: ArrayView3<bool>,
    ) -> CalResult<StabilityResult> {
        let (n_dates, n_bands, rows, cols) = reflectance.dim();
        if valid.dim() != (n_dates, rows, cols) {
            return Err(CalError::Processing(format!(
                "Mask shape {:?} does not match stack shape {:?}",
                valid.dim(),
                reflectance.dim()
            )));
        }
        if n_bands == 0 {
            return Err(CalError::Processing("Stack has no bands".to_string()));
        }
        if !(self.params.std_threshold > 0.0) {
            return Err(CalError::Processing(format!(
                "Std threshold must be positive, got {}",
                self.params.std_threshold
            )));
        }

        log::info!(
            "Temporal stability over {} dates, {} bands, {}x{} pixels (threshold {})",
            n_dates,
            n_bands,
            rows,
            cols,
            self.params.std_threshold
        );

        #[cfg(feature = "parallel")]
        let per_band: Vec<Array2<f32>> = (0..n_bands)
            .into_par_iter()
            .map(|b| self.band_std(reflectance.slice(s![.., b, .., ..]), valid))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let per_band: Vec<Array2<f32>> = (0..n_bands)
            .map(|b| self.band_std(reflectance.slice(s![.., b, .., ..]), valid))
            .collect();

        let mut band_std = Array3::from_elem((n_bands, rows, cols), f32::NAN);
        for (b, std) in per_band.into_iter().enumerate() {
            band_std.index_axis_mut(Axis(0), b).assign(&std);
        }

        let valid_count = valid.map_axis(Axis(0), |lane| lane.iter().filter(|&&v| v).count() as u32);

        let threshold = self.params.std_threshold;
        let stable = band_std.map_axis(Axis(0), |lane| {
            lane.iter().all(|&sd| sd.is_finite() && sd < threshold)
        });

        let result = StabilityResult {
            band_std,
            valid_count,
            stable,
        };
        log::info!(
            "{} of {} pixels are temporally stable",
            result.stable_count(),
            rows * cols
        );
        Ok(result)
    }

    /// Std per pixel of one band; NaN below the minimum observation count
    fn band_std(&self, series: ArrayView3<f32>, valid: ArrayView3<bool>) -> Array2<f32> {
        let (_, rows, cols) = series.dim();
        let mut out = Array2::from_elem((rows, cols), f32::NAN);
        for r in 0..rows {
            for c in 0..cols {
                let (std, n) = masked_std(
                    series
                        .slice(s![.., r, c])
                        .iter()
                        .copied()
                        .zip(valid.slice(s![.., r, c]).iter().copied()),
                );
                if let Some(sd) = std {
                    if n >= self.params.min_valid_dates.max(1) {
                        out[[r, c]] = sd as f32;
                    }
                }
            }
        }
        out
    }
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array3, Array4};

    #[test]
    fn test_masked_std_population() {
        let (sd, n) = masked_std(vec![(1.0, true), (3.0, true)]);
        assert_eq!(n, 2);
        assert_relative_eq!(sd.unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_masked_std_skips_masked_and_nan() {
        let (sd, n) = masked_std(vec![(1.0, true), (100.0, false), (f32::NAN, true), (1.0, true)]);
        assert_eq!(n, 2);
        assert_relative_eq!(sd.unwrap(), 0.0);

        let (sd, n) = masked_std(vec![(1.0, false)]);
        assert_eq!((sd, n), (None, 0));
    }

    #[test]
    fn test_two_date_stack() {
        // 2 dates, 1 band, 2x2 pixels
        let mut refl = Array4::<f32>::zeros((2, 1, 2, 2));
        refl.slice_mut(s![.., 0, .., ..]).fill(0.2);
        refl[[1, 0, 0, 1]] = 0.3;
        let valid = Array3::from_elem((2, 2, 2), true);

        let filter = StabilityFilter::with_params(StabilityParams {
            std_threshold: 0.01,
            min_valid_dates: 1,
        });
        let result = filter.apply_masked(refl.view(), valid.view()).unwrap();

        assert!(result.stable[[0, 0]]);
        assert!(!result.stable[[0, 1]]);
        assert_relative_eq!(result.band_std[[0, 0, 1]], 0.05, epsilon = 1e-6);
        assert_eq!(result.stable_count(), 3);
    }

    #[test]
    fn test_cloudy_observation_is_ignored() {
        let mut refl = Array4::<f32>::from_elem((3, 1, 1, 1), 0.1);
        refl[[2, 0, 0, 0]] = 0.9;
        let mut valid = Array3::from_elem((3, 1, 1), true);
        valid[[2, 0, 0]] = false;

        let result = StabilityFilter::new().apply_masked(refl.view(), valid.view()).unwrap();
        assert!(result.stable[[0, 0]]);
        assert_eq!(result.valid_count[[0, 0]], 2);
    }

    #[test]
    fn test_every_band_must_be_stable() {
        let mut refl = Array4::<f32>::from_elem((2, 2, 1, 2), 0.1);
        // band 1 of pixel (0, 1) drifts
        refl[[1, 1, 0, 1]] = 0.5;
        let valid = Array3::from_elem((2, 1, 2), true);

        let result = StabilityFilter::new().apply_masked(refl.view(), valid.view()).unwrap();
        assert!(result.stable[[0, 0]]);
        assert!(!result.stable[[0, 1]]);

        for ((r, c), &stable) in result.stable.indexed_iter() {
            if stable {
                for b in 0..2 {
                    assert!(result.band_std[[b, r, c]] < 0.01);
                }
            }
        }
    }

    #[test]
    fn test_min_valid_dates() {
        let refl = Array4::<f32>::from_elem((3, 1, 1, 1), 0.1);
        let mut valid = Array3::from_elem((3, 1, 1), false);
        valid[[0, 0, 0]] = true;

        let strict = StabilityFilter::with_params(StabilityParams {
            std_threshold: 0.01,
            min_valid_dates: 2,
        });
        let result = strict.apply_masked(refl.view(), valid.view()).unwrap();
        assert!(!result.stable[[0, 0]]);
        assert!(result.band_std[[0, 0, 0]].is_nan());

        let lenient = StabilityFilter::new();
        assert!(lenient.apply_masked(refl.view(), valid.view()).unwrap().stable[[0, 0]]);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let refl = Array4::<f32>::zeros((2, 1, 2, 2));
        let valid = Array3::from_elem((3, 2, 2), true);
        assert!(StabilityFilter::new().apply_masked(refl.view(), valid.view()).is_err());
    }
}
