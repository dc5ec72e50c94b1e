use crate::types::ClassificationCube;
use ndarray::{Array3, Zip};

/// Whether a scene classification code denotes a usable observation.
///
/// Codes below 1.9, strictly between 2.1 and 3.9, or above 7.1 are kept; everything
/// else (and non-finite codes) is treated as cloud, shadow or cirrus contamination.
#[inline]
pub fn is_clear(code: f32) -> bool {
    code.is_finite() && (code < 1.9 || (code > 2.1 && code < 3.9) || code > 7.1)
}

/// Per-observation validity mask indexed by (time, row, col)
pub fn cloud_mask(classification: &ClassificationCube) -> Array3<bool> {
    log::debug!("Building cloud mask for {:?} classification cube", classification.dim());

    #[cfg(feature = "parallel")]
    let mask = Zip::from(classification).par_map_collect(|&code| is_clear(code));
    #[cfg(not(feature = "parallel"))]
    let mask = Zip::from(classification).map_collect(|&code| is_clear(code));

    let clear = mask.iter().filter(|&&v| v).count();
    log::info!(
        "Cloud mask: {} of {} observations clear ({:.1}%)",
        clear,
        mask.len(),
        100.0 * clear as f64 / mask.len().max(1) as f64
    );
    mask
}
