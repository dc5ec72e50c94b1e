//! Python bindings (feature `python`)

use crate::core::nearest::{nearest_stable_pixels as nearest, StablePixels};
use crate::core::spline::{SmoothingSpline, SplineParams};
use crate::core::stability::{StabilityFilter, StabilityParams};
use crate::types::{GeoTransform, Parcel};
use numpy::{PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray3, PyReadonlyArray4, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(e: crate::types::CalError) -> PyErr {
    PyRuntimeError::new_err(format!("{}", e))
}

/// Cloud mask from scene classification codes (time, row, col)
#[pyfunction]
fn cloud_mask(py: Python, scl: PyReadonlyArray3<f32>) -> PyResult<PyObject> {
    let mask = crate::core::cloud_mask::cloud_mask(&scl.as_array().to_owned());
    Ok(mask.to_pyarray(py).into())
}

/// Temporal stability of a (time, band, row, col) reflectance cube
#[pyfunction]
#[pyo3(signature = (reflectance, valid, std_threshold = 0.01, min_valid_dates = 1))]
fn temporal_stability(
    py: Python,
    reflectance: PyReadonlyArray4<f32>,
    valid: PyReadonlyArray3<bool>,
    std_threshold: f32,
    min_valid_dates: usize,
) -> PyResult<PyObject> {
    let filter = StabilityFilter::with_params(StabilityParams {
        std_threshold,
        min_valid_dates,
    });
    let result = filter
        .apply_masked(reflectance.as_array(), valid.as_array())
        .map_err(to_py_err)?;

    let out = PyDict::new(py);
    out.set_item("stable", result.stable.to_pyarray(py))?;
    out.set_item("band_std", result.band_std.to_pyarray(py))?;
    out.set_item("valid_count", result.valid_count.to_pyarray(py))?;
    out.set_item("stable_count", result.stable_count())?;
    Ok(out.into())
}

/// Rank the stable pixels of `stable` around each parcel centroid
#[pyfunction]
fn nearest_stable_pixels(
    py: Python,
    object_ids: PyReadonlyArray1<i64>,
    x: PyReadonlyArray1<f64>,
    y: PyReadonlyArray1<f64>,
    stable: PyReadonlyArray2<bool>,
    geo_transform: [f64; 6],
    n: usize,
) -> PyResult<PyObject> {
    let (ids, xs, ys) = (object_ids.as_array(), x.as_array(), y.as_array());
    if ids.len() != xs.len() || ids.len() != ys.len() {
        return Err(PyValueError::new_err("object_ids, x and y must have the same length"));
    }
    let parcels: Vec<Parcel> = ids
        .iter()
        .zip(xs.iter().zip(ys.iter()))
        .map(|(&id, (&x, &y))| Parcel { id, x, y })
        .collect();

    let mask = stable.as_array().to_owned();
    let pixels = StablePixels::from_mask(&mask, &GeoTransform::from_gdal(geo_transform));
    let table = nearest(&parcels, &pixels, n, mask.dim()).map_err(to_py_err)?;

    let out = PyDict::new(py);
    out.set_item("object_ids", table.object_ids.to_pyarray(py))?;
    out.set_item("indices", table.indices.to_pyarray(py))?;
    out.set_item("distances", table.distances.to_pyarray(py))?;
    Ok(out.into())
}

/// Smooth a 2D displacement grid; NaN cells are treated as missing
#[pyfunction]
#[pyo3(signature = (z, smoothing = 1.0, knot_spacing = 1))]
fn smooth_displacement_grid(
    py: Python,
    z: PyReadonlyArray2<f64>,
    smoothing: f64,
    knot_spacing: usize,
) -> PyResult<PyObject> {
    let grid = z.as_array().to_owned();
    let params = SplineParams {
        smoothing,
        knot_spacing,
        ..SplineParams::default()
    };
    let spline = SmoothingSpline::fit(&grid, &params).map_err(to_py_err)?;
    let fitted = spline.evaluate();
    let residual = &grid - &fitted;

    let out = PyDict::new(py);
    out.set_item("fitted", fitted.to_pyarray(py))?;
    out.set_item("residual", residual.to_pyarray(py))?;
    out.set_item("iterations", spline.iterations())?;
    out.set_item("converged", spline.converged())?;
    Ok(out.into())
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(cloud_mask, m)?)?;
    m.add_function(wrap_pyfunction!(temporal_stability, m)?)?;
    m.add_function(wrap_pyfunction!(nearest_stable_pixels, m)?)?;
    m.add_function(wrap_pyfunction!(smooth_displacement_grid, m)?)?;
    Ok(())
}
