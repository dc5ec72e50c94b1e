//! Tensor-product smoothing spline over a regular 2D index grid
//!
//! The surface is `s = Br · C · Bcᵀ` where `Br`, `Bc` are uniform cubic B-spline
//! bases along rows and columns. Coefficients minimise
//!
//! ```text
//! Σ w·(z − s)² + λ·(‖Dr·C‖² + ‖C·Dcᵀ‖²)
//! ```
//!
//! with `w` = 1 on finite cells and 0 on missing ones, and `Dr`, `Dc` second-order
//! difference operators (a P-spline). Linear trends are not penalised, so a plane is
//! reproduced exactly for any λ. The normal equations are solved matrix-free with a
//! Jacobi-preconditioned conjugate gradient.

use crate::types::{CalError, CalResult};
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};

/// Spline fitting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplineParams {
    /// Roughness penalty weight (λ ≥ 0); larger values give smoother surfaces
    pub smoothing: f64,
    /// Grid cells per knot interval
    pub knot_spacing: usize,
    /// Upper bound on coefficients per axis; widens the knot spacing on large grids
    pub max_coefficients: usize,
    /// Conjugate gradient iteration limit
    pub max_iterations: usize,
    /// Relative residual norm at which the solver stops
    pub tolerance: f64,
}

impl Default for SplineParams {
    fn default() -> Self {
        Self {
            smoothing: 1.0,
            knot_spacing: 1,
            max_coefficients: 96,
            max_iterations: 2000,
            tolerance: 1e-10,
        }
    }
}

/// Keeps the system positive definite when data and penalty leave a direction free
const RIDGE: f64 = 1e-9;

/// Uniform cubic B-spline basis evaluated at integer positions `0..n_points`.
///
/// Returns an `n_points x (intervals + 3)` matrix.
fn cubic_basis(n_points: usize, intervals: usize) -> Array2<f64> {
    let m = intervals.max(1);
    let span = if n_points > 1 { (n_points - 1) as f64 } else { 1.0 };
    let h = span / m as f64;

    let mut basis = Array2::zeros((n_points, m + 3));
    for i in 0..n_points {
        let u = i as f64 / h;
        let j = (u.floor() as usize).min(m - 1);
        let t = u - j as f64;
        let t2 = t * t;
        let t3 = t2 * t;
        basis[[i, j]] = (1.0 - t).powi(3) / 6.0;
        basis[[i, j + 1]] = (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0;
        basis[[i, j + 2]] = (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0;
        basis[[i, j + 3]] = t3 / 6.0;
    }
    basis
}

/// `Dᵀ·D` for the second-order difference operator on `k` coefficients
fn second_difference_gram(k: usize) -> Array2<f64> {
    let mut gram = Array2::zeros((k, k));
    if k < 3 {
        return gram;
    }
    for row in 0..k - 2 {
        let stencil = [(row, 1.0), (row + 1, -2.0), (row + 2, 1.0)];
        for &(a, va) in &stencil {
            for &(b, vb) in &stencil {
                gram[[a, b]] += va * vb;
            }
        }
    }
    gram
}

/// Number of knot intervals for an axis of `n` grid points
fn interval_count(n: usize, params: &SplineParams) -> usize {
    if n <= 1 {
        return 1;
    }
    let spacing = params.knot_spacing.max(1);
    let wanted = (n - 1 + spacing - 1) / spacing;
    let cap = params.max_coefficients.max(4) - 3;
    wanted.clamp(1, cap)
}

fn dot(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + x * y)
}

/// A fitted smoothing spline surface
#[derive(Debug, Clone)]
pub struct SmoothingSpline {
    coefficients: Array2<f64>,
    row_basis: Array2<f64>,
    col_basis: Array2<f64>,
    iterations: usize,
    converged: bool,
}

/// Normal-equation operator of the penalised least-squares problem
struct NormalOperator<'a> {
    row_basis: &'a Array2<f64>,
    col_basis: &'a Array2<f64>,
    weights: &'a Array2<f64>,
    row_penalty: Array2<f64>,
    col_penalty: Array2<f64>,
    smoothing: f64,
}

impl NormalOperator<'_> {
    fn apply(&self, c: &Array2<f64>) -> Array2<f64> {
        let surface = self.row_basis.dot(c).dot(&self.col_basis.t());
        let weighted = &surface * self.weights;
        let mut out = self.row_basis.t().dot(&weighted).dot(self.col_basis);
        if self.smoothing > 0.0 {
            out = out + (self.row_penalty.dot(c) + c.dot(&self.col_penalty)) * self.smoothing;
        }
        out + c * RIDGE
    }

    fn diagonal(&self) -> Array2<f64> {
        let br2 = self.row_basis.mapv(|v| v * v);
        let bc2 = self.col_basis.mapv(|v| v * v);
        let mut diag = br2.t().dot(self.weights).dot(&bc2);
        let pr: Array1<f64> = self.row_penalty.diag().to_owned();
        let pc: Array1<f64> = self.col_penalty.diag().to_owned();
        for ((a, b), d) in diag.indexed_iter_mut() {
            *d += self.smoothing * (pr[a] + pc[b]) + RIDGE;
        }
        diag
    }
}

impl SmoothingSpline {
    /// Fit a surface to the finite cells of `z`; NaN cells are ignored
    pub fn fit(z: &Array2<f64>, params: &SplineParams) -> CalResult<Self> {
        let (rows, cols) = z.dim();
        if rows == 0 || cols == 0 {
            return Err(CalError::Processing("Empty grid".to_string()));
        }
        if !(params.smoothing >= 0.0) {
            return Err(CalError::Processing(format!(
                "Smoothing factor must be non-negative, got {}",
                params.smoothing
            )));
        }

        let weights = z.mapv(|v| if v.is_finite() { 1.0 } else { 0.0 });
        let samples = weights.sum() as usize;
        if samples < 3 {
            return Err(CalError::Processing(format!(
                "Need at least 3 finite grid cells for a spline fit, found {}",
                samples
            )));
        }
        let data = z.mapv(|v| if v.is_finite() { v } else { 0.0 });

        let row_basis = cubic_basis(rows, interval_count(rows, params));
        let col_basis = cubic_basis(cols, interval_count(cols, params));
        let (kr, kc) = (row_basis.ncols(), col_basis.ncols());
        log::debug!(
            "Spline fit: {}x{} grid, {} samples, {}x{} coefficients, smoothing {}",
            rows,
            cols,
            samples,
            kr,
            kc,
            params.smoothing
        );

        let op = NormalOperator {
            row_basis: &row_basis,
            col_basis: &col_basis,
            weights: &weights,
            row_penalty: second_difference_gram(kr),
            col_penalty: second_difference_gram(kc),
            smoothing: params.smoothing,
        };

        let rhs = row_basis.t().dot(&data).dot(&col_basis);
        let inv_diag = op.diagonal().mapv(|d| 1.0 / d);

        // preconditioned conjugate gradient
        let mut c = Array2::<f64>::zeros((kr, kc));
        let rhs_norm = dot(&rhs, &rhs).sqrt();
        let mut iterations = 0;
        let mut converged = rhs_norm == 0.0;
        if !converged {
            let mut r = rhs.clone();
            let mut zr = &r * &inv_diag;
            let mut p = zr.clone();
            let mut rz = dot(&r, &zr);

            while iterations < params.max_iterations {
                iterations += 1;
                let ap = op.apply(&p);
                let pap = dot(&p, &ap);
                if pap <= 0.0 {
                    break;
                }
                let alpha = rz / pap;
                c.scaled_add(alpha, &p);
                r.scaled_add(-alpha, &ap);

                if dot(&r, &r).sqrt() <= params.tolerance * rhs_norm {
                    converged = true;
                    break;
                }

                zr = &r * &inv_diag;
                let rz_next = dot(&r, &zr);
                let beta = rz_next / rz;
                rz = rz_next;
                p = &zr + &(p * beta);
            }
        }

        if converged {
            log::debug!("Spline solver converged after {} iterations", iterations);
        } else {
            log::warn!(
                "Spline solver stopped after {} iterations without reaching tolerance {:e}",
                iterations,
                params.tolerance
            );
        }

        Ok(Self {
            coefficients: c,
            row_basis,
            col_basis,
            iterations,
            converged,
        })
    }

    /// Fitted surface on the grid the spline was fitted to
    pub fn evaluate(&self) -> Array2<f64> {
        self.row_basis.dot(&self.coefficients).dot(&self.col_basis.t())
    }

    pub fn coefficients(&self) -> &Array2<f64> {
        &self.coefficients
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}

/// Second-difference roughness of a surface along both axes
pub fn roughness(surface: &Array2<f64>) -> f64 {
    let (rows, cols) = surface.dim();
    let mut total = 0.0;
    for r in 0..rows {
        for c in 0..cols {
            if r + 2 < rows {
                let d = surface[[r, c]] - 2.0 * surface[[r + 1, c]] + surface[[r + 2, c]];
                total += d * d;
            }
            if c + 2 < cols {
                let d = surface[[r, c]] - 2.0 * surface[[r, c + 1]] + surface[[r, c + 2]];
                total += d * d;
            }
        }
    }
    total
}
