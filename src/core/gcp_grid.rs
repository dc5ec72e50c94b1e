use crate::core::spline::{SmoothingSpline, SplineParams};
use crate::io::gcp_table::{read_gcp_table, write_gcp_table, GcpRecord, TableFormat};
use crate::types::{CalError, CalResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Refuse to allocate grids larger than this many cells
const MAX_GRID_CELLS: usize = 50_000_000;

/// Relative disagreement between user and inferred step that triggers a warning
const STEP_TOLERANCE: f64 = 1e-6;

/// GCP smoothing and filtering parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpSmoothingParams {
    /// Grid step along x
    pub xstp: f64,
    /// Grid step along y
    pub ystp: f64,
    /// Smoothing factor of the x displacement spline
    pub smooth_x: f64,
    /// Smoothing factor of the y displacement spline
    pub smooth_y: f64,
    /// Maximum absolute x residual of a kept sample
    pub thr_x: f64,
    /// Maximum absolute y residual of a kept sample
    pub thr_y: f64,
    /// Write fitted instead of measured displacements
    pub replace: bool,
    /// Grid cells per spline knot interval
    pub knot_spacing: usize,
    pub format: TableFormat,
}

impl Default for GcpSmoothingParams {
    fn default() -> Self {
        Self {
            xstp: 100.0,
            ystp: 100.0,
            smooth_x: 1.0,
            smooth_y: 1.0,
            thr_x: 1.0,
            thr_y: 1.0,
            replace: false,
            knot_spacing: 1,
            format: TableFormat::Plain,
        }
    }
}

impl GcpSmoothingParams {
    fn spline_params(&self, smoothing: f64) -> SplineParams {
        SplineParams {
            smoothing,
            knot_spacing: self.knot_spacing,
            ..SplineParams::default()
        }
    }
}

/// Minimum positive spacing between the sorted unique values
pub fn infer_step(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&d| d > 0.0)
        .min_by(|a, b| a.total_cmp(b))
}

/// Validate a user step and warn when the data suggest a different one
pub fn check_step(values: &[f64], step: f64, axis: &str) -> CalResult<f64> {
    if !(step.is_finite() && step > 0.0) {
        return Err(CalError::Processing(format!(
            "Grid step along {} must be positive, got {}",
            axis, step
        )));
    }
    match infer_step(values) {
        Some(inferred) if ((inferred - step) / step).abs() > STEP_TOLERANCE => {
            log::warn!(
                "Grid step along {} is {} but the samples are spaced by {}; using {}",
                axis,
                step,
                inferred,
                step
            );
        }
        Some(inferred) => log::debug!("Grid step along {} confirmed: {}", axis, inferred),
        None => log::debug!("Single {} coordinate, step {} cannot be checked", axis, step),
    }
    Ok(step)
}

/// Scattered GCP samples placed on a regular index grid.
///
/// Arrays are indexed `[iy, ix]` with `ix = round((grid_x - x0) / xstp)` counted
/// from the smallest grid coordinate. Missing cells hold NaN.
#[derive(Debug, Clone)]
pub struct GcpGrid {
    records: Vec<GcpRecord>,
    /// (iy, ix) of each record
    cells: Vec<(usize, usize)>,
    /// Whether the displaced position of each record stays on the grid
    in_grid: Vec<bool>,
    x0: f64,
    y0: f64,
    xstp: f64,
    ystp: f64,
    pub disp_x: Array2<f64>,
    pub disp_y: Array2<f64>,
}

/// Spline fits and residuals of a [`GcpGrid`]
#[derive(Debug, Clone)]
pub struct SmoothedGrid {
    pub fit_x: Array2<f64>,
    pub fit_y: Array2<f64>,
    /// Raw minus fitted; NaN on missing cells
    pub res_x: Array2<f64>,
    pub res_y: Array2<f64>,
}

impl GcpGrid {
    pub fn build(records: &[GcpRecord], xstp: f64, ystp: f64) -> CalResult<Self> {
        if records.is_empty() {
            return Err(CalError::Processing("No GCP records to grid".to_string()));
        }
        let gx: Vec<f64> = records.iter().map(|r| r.grid_x).collect();
        let gy: Vec<f64> = records.iter().map(|r| r.grid_y).collect();
        if gx.iter().chain(&gy).any(|v| !v.is_finite()) {
            return Err(CalError::InvalidFormat(
                "GCP grid coordinates must be finite".to_string(),
            ));
        }
        let xstp = check_step(&gx, xstp, "x")?;
        let ystp = check_step(&gy, ystp, "y")?;

        let x0 = gx.iter().copied().fold(f64::INFINITY, f64::min);
        let y0 = gy.iter().copied().fold(f64::INFINITY, f64::min);
        let x1 = gx.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let y1 = gy.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // bound the grid size before any index is cast to usize
        let span_x = ((x1 - x0) / xstp).round() + 1.0;
        let span_y = ((y1 - y0) / ystp).round() + 1.0;
        if !span_x.is_finite() || !span_y.is_finite() || span_x * span_y > MAX_GRID_CELLS as f64 {
            return Err(CalError::Processing(format!(
                "GCP grid of {:e}x{:e} cells is too large; check the grid steps",
                span_y, span_x
            )));
        }

        let cells: Vec<(usize, usize)> = records
            .iter()
            .map(|r| {
                let ix = ((r.grid_x - x0) / xstp).round() as usize;
                let iy = ((r.grid_y - y0) / ystp).round() as usize;
                (iy, ix)
            })
            .collect();
        let nx = cells.iter().map(|&(_, ix)| ix).max().unwrap_or(0) + 1;
        let ny = cells.iter().map(|&(iy, _)| iy).max().unwrap_or(0) + 1;

        // displaced positions must stay within the grid extent
        let (xmin, xmax) = (x0 - 0.5 * xstp, x0 + (nx as f64 - 0.5) * xstp);
        let (ymin, ymax) = (y0 - 0.5 * ystp, y0 + (ny as f64 - 0.5) * ystp);
        let in_grid: Vec<bool> = records
            .iter()
            .map(|r| {
                let px = r.grid_x + r.disp_x;
                let py = r.grid_y + r.disp_y;
                px.is_finite() && py.is_finite() && px >= xmin && px <= xmax && py >= ymin && py <= ymax
            })
            .collect();

        let mut disp_x = Array2::from_elem((ny, nx), f64::NAN);
        let mut disp_y = Array2::from_elem((ny, nx), f64::NAN);
        let mut occupied = Array2::from_elem((ny, nx), false);
        let mut duplicates = 0usize;
        for ((record, &(iy, ix)), &ok) in records.iter().zip(&cells).zip(&in_grid) {
            if occupied[[iy, ix]] {
                duplicates += 1;
            }
            occupied[[iy, ix]] = true;
            if ok {
                disp_x[[iy, ix]] = record.disp_x;
                disp_y[[iy, ix]] = record.disp_y;
            } else {
                disp_x[[iy, ix]] = f64::NAN;
                disp_y[[iy, ix]] = f64::NAN;
            }
        }
        if duplicates > 0 {
            log::warn!("{} GCP samples share a grid cell; keeping the last one", duplicates);
        }

        let outside = in_grid.iter().filter(|&&ok| !ok).count();
        if outside > 0 {
            log::warn!("{} GCP samples are displaced outside the grid and are ignored", outside);
        }
        log::info!(
            "Gridded {} GCPs onto {}x{} cells (step {} x {})",
            records.len(),
            ny,
            nx,
            xstp,
            ystp
        );

        Ok(Self {
            records: records.to_vec(),
            cells,
            in_grid,
            x0,
            y0,
            xstp,
            ystp,
            disp_x,
            disp_y,
        })
    }

    /// (rows, cols) of the grid
    pub fn shape(&self) -> (usize, usize) {
        self.disp_x.dim()
    }

    pub fn records(&self) -> &[GcpRecord] {
        &self.records
    }

    /// Grid coordinates of cell (iy, ix)
    pub fn cell_position(&self, iy: usize, ix: usize) -> (f64, f64) {
        (self.x0 + ix as f64 * self.xstp, self.y0 + iy as f64 * self.ystp)
    }

    /// Fit one smoothing spline per displacement axis
    pub fn smooth(&self, params: &GcpSmoothingParams) -> CalResult<SmoothedGrid> {
        log::info!(
            "Fitting displacement splines (smooth_x {}, smooth_y {})",
            params.smooth_x,
            params.smooth_y
        );
        let fit_x = SmoothingSpline::fit(&self.disp_x, &params.spline_params(params.smooth_x))?.evaluate();
        let fit_y = SmoothingSpline::fit(&self.disp_y, &params.spline_params(params.smooth_y))?.evaluate();
        let res_x = &self.disp_x - &fit_x;
        let res_y = &self.disp_y - &fit_y;
        Ok(SmoothedGrid {
            fit_x,
            fit_y,
            res_x,
            res_y,
        })
    }

    /// (res_x, res_y) of every record; NaN for samples displaced off the grid
    pub fn record_residuals(&self, smoothed: &SmoothedGrid) -> Vec<(f64, f64)> {
        self.records
            .iter()
            .zip(&self.cells)
            .zip(&self.in_grid)
            .map(|((record, &(iy, ix)), &ok)| {
                if ok {
                    (
                        record.disp_x - smoothed.fit_x[[iy, ix]],
                        record.disp_y - smoothed.fit_y[[iy, ix]],
                    )
                } else {
                    (f64::NAN, f64::NAN)
                }
            })
            .collect()
    }

    /// Records whose residuals lie within both thresholds
    pub fn filter_records(&self, smoothed: &SmoothedGrid, params: &GcpSmoothingParams) -> Vec<GcpRecord> {
        let kept: Vec<GcpRecord> = self
            .records
            .iter()
            .zip(&self.cells)
            .zip(self.record_residuals(smoothed))
            .filter(|(_, (rx, ry))| rx.abs() <= params.thr_x && ry.abs() <= params.thr_y)
            .map(|((record, &(iy, ix)), _)| {
                let mut out = *record;
                if params.replace {
                    out.disp_x = smoothed.fit_x[[iy, ix]];
                    out.disp_y = smoothed.fit_y[[iy, ix]];
                }
                out
            })
            .collect();

        log::info!(
            "Kept {} of {} GCPs (thr_x {}, thr_y {})",
            kept.len(),
            self.records.len(),
            params.thr_x,
            params.thr_y
        );
        kept
    }
}

/// Grids, smooths and filters GCP displacement tables
pub struct GcpSmoother {
    params: GcpSmoothingParams,
}

impl GcpSmoother {
    pub fn new() -> Self {
        Self {
            params: GcpSmoothingParams::default(),
        }
    }

    pub fn with_params(params: GcpSmoothingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GcpSmoothingParams {
        &self.params
    }

    /// Filter in-memory records
    pub fn process(&self, records: &[GcpRecord]) -> CalResult<Vec<GcpRecord>> {
        let grid = GcpGrid::build(records, self.params.xstp, self.params.ystp)?;
        let smoothed = grid.smooth(&self.params)?;
        Ok(grid.filter_records(&smoothed, &self.params))
    }

    /// Read `input`, filter, and write the surviving rows to `output`.
    /// Returns the number of rows written.
    pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(&self, input: P, output: Q) -> CalResult<usize> {
        let records = read_gcp_table(input)?;
        let kept = self.process(&records)?;
        write_gcp_table(output, &kept, self.params.format)?;
        Ok(kept.len())
    }
}

impl Default for GcpSmoother {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn record(gx: f64, gy: f64, dx: f64, dy: f64) -> GcpRecord {
        GcpRecord {
            grid_x: gx,
            grid_y: gy,
            observed_x: gx + dx,
            observed_y: gy + dy,
            disp_x: dx,
            disp_y: dy,
            radius: 0.2,
            radius_90: 0.4,
        }
    }

    /// Linear displacement field on a 9x9 grid with 100 m steps
    fn planar_records() -> Vec<GcpRecord> {
        let mut records = Vec::new();
        for iy in 0..9 {
            for ix in 0..9 {
                let gx = 1000.0 + 100.0 * ix as f64;
                let gy = 5000.0 + 100.0 * iy as f64;
                records.push(record(gx, gy, 0.5 + 0.002 * ix as f64 * 100.0, -1.0 + 0.01 * iy as f64));
            }
        }
        records
    }

    #[test]
    fn test_infer_step() {
        assert_eq!(infer_step(&[0.0, 200.0, 100.0, 400.0, 100.0]), Some(100.0));
        assert_eq!(infer_step(&[5.0, 5.0]), None);
        assert_eq!(infer_step(&[]), None);
    }

    #[test]
    fn test_check_step_keeps_user_value() {
        assert_eq!(check_step(&[0.0, 50.0, 100.0], 100.0, "x").unwrap(), 100.0);
        assert!(check_step(&[0.0, 1.0], 0.0, "x").is_err());
        assert!(check_step(&[0.0, 1.0], f64::NAN, "y").is_err());
    }

    #[test]
    fn test_build_grid_with_gaps() {
        let records = vec![
            record(10.0, 20.0, 1.0, 2.0),
            record(30.0, 20.0, 3.0, 4.0),
            record(10.0, 30.0, 5.0, 6.0),
        ];
        let grid = GcpGrid::build(&records, 10.0, 10.0).unwrap();
        assert_eq!(grid.shape(), (2, 3));
        assert_eq!(grid.disp_x[[0, 0]], 1.0);
        assert_eq!(grid.disp_y[[0, 2]], 4.0);
        assert_eq!(grid.disp_x[[1, 0]], 5.0);
        assert!(grid.disp_x[[0, 1]].is_nan());
        assert!(grid.disp_x[[1, 2]].is_nan());
        assert_eq!(grid.cell_position(1, 2), (30.0, 30.0));
    }

    #[test]
    fn test_oversized_grid_is_error() {
        let records: Vec<GcpRecord> = (0..4).map(|i| record(i as f64 * 1e10, 0.0, 0.0, 0.0)).collect();
        let err = GcpGrid::build(&records, 1e-300, 1.0).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let err = GcpGrid::build(&records, 1.0, 1.0).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let single_row: Vec<GcpRecord> = (0..10).map(|i| record(i as f64 * 10.0, 0.0, 0.0, 0.0)).collect();
        assert_eq!(GcpGrid::build(&single_row, 10.0, 1.0).unwrap().shape(), (1, 10));
    }

    #[test]
    fn test_duplicate_cell_keeps_last() {
        let records = vec![
            record(0.0, 0.0, 1.0, 1.0),
            record(10.0, 0.0, 2.0, 2.0),
            record(0.0, 0.0, 3.0, 3.0),
        ];
        let grid = GcpGrid::build(&records, 10.0, 10.0).unwrap();
        assert_eq!(grid.disp_x[[0, 0]], 3.0);
    }

    #[test]
    fn test_residual_is_raw_minus_fit() {
        let mut records = planar_records();
        records.remove(17);
        let grid = GcpGrid::build(&records, 100.0, 100.0).unwrap();
        let smoothed = grid.smooth(&GcpSmoothingParams::default()).unwrap();

        for ((idx, &raw), &fit) in grid.disp_x.indexed_iter().zip(smoothed.fit_x.iter()) {
            let res = smoothed.res_x[idx];
            if raw.is_finite() {
                assert_abs_diff_eq!(res, raw - fit, epsilon = 1e-12);
                // linear field is reproduced
                assert!(res.abs() < 1e-4);
            } else {
                assert!(res.is_nan());
            }
        }
    }

    #[test]
    fn test_outlier_is_filtered() {
        let mut records = planar_records();
        let outlier = 4 * 9 + 4;
        records[outlier].disp_x += 30.0;

        let params = GcpSmoothingParams {
            thr_x: 5.0,
            thr_y: 5.0,
            ..GcpSmoothingParams::default()
        };
        let smoother = GcpSmoother::with_params(params.clone());
        let kept = smoother.process(&records).unwrap();

        assert_eq!(kept.len(), records.len() - 1);
        assert!(!kept.contains(&records[outlier]));

        let grid = GcpGrid::build(&records, 100.0, 100.0).unwrap();
        let smoothed = grid.smooth(&params).unwrap();
        let residuals = grid.record_residuals(&smoothed);
        for (rec, (rx, ry)) in records.iter().zip(residuals) {
            if kept.contains(rec) {
                assert!(rx.abs() <= params.thr_x && ry.abs() <= params.thr_y);
            }
        }
    }

    #[test]
    fn test_off_grid_displacement_is_dropped() {
        let mut records = planar_records();
        // pushed far beyond the western edge
        records[0].disp_x = -500.0;
        records[1].disp_y = f64::NAN;

        let params = GcpSmoothingParams {
            thr_x: 5.0,
            thr_y: 5.0,
            ..GcpSmoothingParams::default()
        };
        let grid = GcpGrid::build(&records, 100.0, 100.0).unwrap();
        assert!(grid.disp_x[[0, 0]].is_nan());

        let smoothed = grid.smooth(&params).unwrap();
        let residuals = grid.record_residuals(&smoothed);
        assert!(residuals[0].0.is_nan());
        assert!(residuals[1].1.is_nan());

        let kept = grid.filter_records(&smoothed, &params);
        assert_eq!(kept.len(), records.len() - 2);
    }

    #[test]
    fn test_replace_writes_fitted_displacement() {
        let records = planar_records();
        let params = GcpSmoothingParams {
            thr_x: 5.0,
            thr_y: 5.0,
            replace: true,
            ..GcpSmoothingParams::default()
        };
        let grid = GcpGrid::build(&records, 100.0, 100.0).unwrap();
        let smoothed = grid.smooth(&params).unwrap();
        let kept = grid.filter_records(&smoothed, &params);

        assert_eq!(kept.len(), records.len());
        assert_eq!(kept[10].disp_x, smoothed.fit_x[[1, 1]]);
        assert_eq!(kept[10].disp_y, smoothed.fit_y[[1, 1]]);
        assert_eq!(kept[10].grid_x, records[10].grid_x);
    }

    #[test]
    fn test_run_roundtrip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("gcps.dat");
        let output = dir.path().join("gcps_filtered.dat");

        let mut records = planar_records();
        records[40].disp_y -= 25.0;
        write_gcp_table(&input, &records, TableFormat::Long).unwrap();

        let smoother = GcpSmoother::with_params(GcpSmoothingParams {
            thr_x: 2.0,
            thr_y: 2.0,
            format: TableFormat::Exponential,
            ..GcpSmoothingParams::default()
        });
        let written = smoother.run(&input, &output).unwrap();
        assert_eq!(written, records.len() - 1);
        assert_eq!(read_gcp_table(&output).unwrap().len(), written);
    }
}
