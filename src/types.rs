use chrono::NaiveDate;
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

/// Scaled surface reflectance value
pub type Reflectance = f32;

/// Reflectance stack indexed by (time, band, row, col)
pub type ReflectanceCube = Array4<Reflectance>;

/// Scene classification codes indexed by (time, row, col)
pub type ClassificationCube = Array3<f32>;

/// Multiplier converting stored Sentinel-2 L2A digital numbers to reflectance
pub const REFLECTANCE_SCALE: f32 = 1.0e-4;

/// No-data value written into diagnostic rasters
pub const OUTPUT_NO_DATA: f64 = -9999.0;

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Geographic coordinates of the centre of pixel (row, col)
    pub fn pixel_centre(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Compare two transforms with a tolerance relative to the pixel size
    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        let tol = 1e-6 * self.pixel_width.abs().max(self.pixel_height.abs()).max(1e-12);
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, -1.0])
    }
}

/// Agricultural parcel reduced to its centroid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

/// Time series of co-registered multi-band acquisitions
#[derive(Debug, Clone)]
pub struct RasterStack {
    /// Acquisition date per time step
    pub dates: Vec<NaiveDate>,
    /// Band names, in the order of the band axis of `reflectance`
    pub band_names: Vec<String>,
    /// (time, band, row, col)
    pub reflectance: ReflectanceCube,
    /// (time, row, col)
    pub classification: ClassificationCube,
    pub projection: String,
    pub geo_transform: GeoTransform,
}

impl RasterStack {
    /// Number of rows and columns of the common grid
    pub fn grid_shape(&self) -> (usize, usize) {
        let (_, _, rows, cols) = self.reflectance.dim();
        (rows, cols)
    }

    pub fn num_dates(&self) -> usize {
        self.dates.len()
    }
}

/// Error types for calibration processing
#[derive(Debug, thiserror::Error)]
pub enum CalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Raster grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Missing band: {0}")]
    MissingBand(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl From<ndarray_npy::WriteNpzError> for CalError {
    fn from(e: ndarray_npy::WriteNpzError) -> Self {
        CalError::Archive(e.to_string())
    }
}

impl From<ndarray_npy::ReadNpzError> for CalError {
    fn from(e: ndarray_npy::ReadNpzError) -> Self {
        CalError::Archive(e.to_string())
    }
}

/// Result type for calibration operations
pub type CalResult<T> = Result<T, CalError>;
