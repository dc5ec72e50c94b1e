//! Core processing modules

pub mod cloud_mask;
pub mod stability;
pub mod nearest;
pub mod reference;
pub mod spline;
pub mod gcp_grid;

// Re-export main types
pub use cloud_mask::{cloud_mask, is_clear};
pub use stability::{StabilityFilter, StabilityParams, StabilityResult};
pub use nearest::{
    nearest_stable_pixels, pixel_centres, read_neighbor_archive, write_neighbor_archive,
    NeighborTable, StablePixels,
};
pub use reference::{write_stability_geotiff, ReferenceSelection, ReferenceSelectionParams, ReferenceSelector};
pub use spline::{SmoothingSpline, SplineParams};
pub use gcp_grid::{infer_step, GcpGrid, GcpSmoother, GcpSmoothingParams, SmoothedGrid};
