//! I/O modules for reading acquisitions, parcels and GCP tables and writing results

pub mod raster;
pub mod parcels;
pub mod gcp_table;

pub use raster::{read_raster_stack, scan_dated_rasters, write_geotiff, DatedRaster, RasterInfo};
pub use parcels::ParcelReader;
pub use gcp_table::{read_gcp_table, write_gcp_table, GcpRecord, TableFormat};
