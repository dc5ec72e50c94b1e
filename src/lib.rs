//! cropcal: reference-pixel selection and GCP grid smoothing for crop monitoring
//!
//! This library selects temporally stable Sentinel-2 pixels near agricultural parcels
//! as calibration references, and cleans ground-control-point displacement tables by
//! fitting smoothing splines and rejecting outliers.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{CalError, CalResult, GeoTransform, Parcel, RasterStack};

pub use io::{ParcelReader, GcpRecord, TableFormat};
pub use core::{
    GcpSmoother, GcpSmoothingParams, NeighborTable, ReferenceSelectionParams, ReferenceSelector,
    SmoothingSpline, SplineParams, StabilityFilter, StabilityParams,
};
