use crate::types::{
    CalError, CalResult, ClassificationCube, GeoTransform, RasterStack, ReflectanceCube,
    REFLECTANCE_SCALE,
};
use chrono::NaiveDate;
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, Axis};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default name of the scene classification band
pub const DEFAULT_SCL_BAND: &str = "SCL";

/// A GeoTIFF acquisition tagged with its date
#[derive(Debug, Clone, PartialEq)]
pub struct DatedRaster {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// Header information of a raster file
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub projection: String,
    pub geo_transform: GeoTransform,
    pub band_descriptions: Vec<String>,
    pub no_data: Option<f64>,
}

/// Eight-digit runs that may hold a `YYYYMMDD` date, compiled once
fn date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d{8})").ok()).as_ref()
}

/// Extract the first valid `YYYYMMDD` date embedded in a file name
pub fn parse_acquisition_date(file_name: &str) -> Option<NaiveDate> {
    date_pattern()?
        .captures_iter(file_name)
        .filter_map(|cap| NaiveDate::parse_from_str(&cap[1], "%Y%m%d").ok())
        .next()
}

/// List dated GeoTIFFs in `dir` whose acquisition date falls in `[start, end]`
pub fn scan_dated_rasters<P: AsRef<Path>>(
    dir: P,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> CalResult<Vec<DatedRaster>> {
    let dir = dir.as_ref();
    log::info!("Scanning {} for dated rasters", dir.display());

    let mut rasters = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tiff = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        if !is_tiff {
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let date = match parse_acquisition_date(file_name) {
            Some(d) => d,
            None => {
                log::warn!("No acquisition date in file name {}, skipping", file_name);
                continue;
            }
        };

        if start.map_or(false, |s| date < s) || end.map_or(false, |e| date > e) {
            log::debug!("{} outside date range, skipping", file_name);
            continue;
        }
        rasters.push(DatedRaster { date, path });
    }

    rasters.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));

    if rasters.is_empty() {
        return Err(CalError::InvalidFormat(format!(
            "No dated GeoTIFF files found in {} for the requested date range",
            dir.display()
        )));
    }

    log::info!(
        "Found {} acquisitions from {} to {}",
        rasters.len(),
        rasters[0].date,
        rasters[rasters.len() - 1].date
    );
    Ok(rasters)
}

/// Read size, projection, geotransform and band descriptions of a raster
pub fn read_raster_info<P: AsRef<Path>>(path: P) -> CalResult<RasterInfo> {
    let dataset = Dataset::open(path.as_ref())?;
    raster_info(&dataset)
}

fn raster_info(dataset: &Dataset) -> CalResult<RasterInfo> {
    let (width, height) = dataset.raster_size();
    let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);

    let mut band_descriptions = Vec::new();
    let mut no_data = None;
    for idx in 1..=dataset.raster_count() {
        let band = dataset.rasterband(idx)?;
        band_descriptions.push(band.description().unwrap_or_default());
        if no_data.is_none() {
            no_data = band.no_data_value();
        }
    }

    Ok(RasterInfo {
        width,
        height,
        projection: dataset.projection(),
        geo_transform,
        band_descriptions,
        no_data,
    })
}

/// Locate a band by its description, returning the 1-based GDAL band index
fn find_band(descriptions: &[String], name: &str) -> Option<isize> {
    descriptions
        .iter()
        .position(|d| d == name)
        .or_else(|| descriptions.iter().position(|d| d.eq_ignore_ascii_case(name)))
        .map(|i| i as isize + 1)
}

fn read_band(dataset: &Dataset, index: isize, width: usize, height: usize) -> CalResult<Array2<f32>> {
    let band = dataset.rasterband(index)?;
    let band_data = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    Array2::from_shape_vec((height, width), band_data.data)
        .map_err(|e| CalError::Processing(format!("Failed to reshape band {}: {}", index, e)))
}

/// Read a time series of acquisitions into a single stack.
///
/// Every file must share the grid size, projection and geotransform of the first
/// one and carry all requested bands plus the scene classification band. Reflectance
/// is scaled by [`REFLECTANCE_SCALE`]; the classification codes are kept as-is.
pub fn read_raster_stack(
    rasters: &[DatedRaster],
    bands: &[String],
    scl_band: &str,
) -> CalResult<RasterStack> {
    if rasters.is_empty() {
        return Err(CalError::InvalidFormat("No rasters to stack".to_string()));
    }
    if bands.is_empty() {
        return Err(CalError::InvalidFormat("No bands requested".to_string()));
    }

    log::info!(
        "Stacking {} acquisitions, bands {:?} (classification band {})",
        rasters.len(),
        bands,
        scl_band
    );

    let reference = read_raster_info(&rasters[0].path)?;
    let (width, height) = (reference.width, reference.height);
    log::debug!("Reference grid: {}x{} {:?}", width, height, reference.geo_transform);

    let mut reflectance: ReflectanceCube = Array4::zeros((rasters.len(), bands.len(), height, width));
    let mut classification: ClassificationCube = Array3::zeros((rasters.len(), height, width));

    for (t, raster) in rasters.iter().enumerate() {
        let dataset = Dataset::open(&raster.path)?;
        let info = raster_info(&dataset)?;
        validate_grid(&reference, &info, &raster.path)?;

        for (b, name) in bands.iter().enumerate() {
            let idx = find_band(&info.band_descriptions, name).ok_or_else(|| {
                CalError::MissingBand(format!("{} not found in {}", name, raster.path.display()))
            })?;
            let data = read_band(&dataset, idx, width, height)?;
            reflectance
                .slice_mut(s![t, b, .., ..])
                .assign(&data.mapv(|v| v * REFLECTANCE_SCALE));
        }

        let scl_idx = find_band(&info.band_descriptions, scl_band).ok_or_else(|| {
            CalError::MissingBand(format!("{} not found in {}", scl_band, raster.path.display()))
        })?;
        let scl = read_band(&dataset, scl_idx, width, height)?;
        classification.index_axis_mut(Axis(0), t).assign(&scl);

        log::debug!("Loaded acquisition {} ({})", raster.date, raster.path.display());
    }

    Ok(RasterStack {
        dates: rasters.iter().map(|r| r.date).collect(),
        band_names: bands.to_vec(),
        reflectance,
        classification,
        projection: reference.projection,
        geo_transform: reference.geo_transform,
    })
}

fn validate_grid(reference: &RasterInfo, info: &RasterInfo, path: &Path) -> CalResult<()> {
    if (info.width, info.height) != (reference.width, reference.height) {
        return Err(CalError::GridMismatch(format!(
            "{} is {}x{}, expected {}x{}",
            path.display(),
            info.width,
            info.height,
            reference.width,
            reference.height
        )));
    }
    if info.projection != reference.projection {
        return Err(CalError::GridMismatch(format!(
            "{} has a different projection",
            path.display()
        )));
    }
    if !info.geo_transform.approx_eq(&reference.geo_transform) {
        return Err(CalError::GridMismatch(format!(
            "{} has geotransform {:?}, expected {:?}",
            path.display(),
            info.geo_transform.to_gdal(),
            reference.geo_transform.to_gdal()
        )));
    }
    Ok(())
}

/// Write float32 bands to a DEFLATE-compressed GeoTIFF.
///
/// Each band gets the matching entry of `descriptions` and the shared `no_data` value.
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    bands: &[ArrayView2<f32>],
    descriptions: &[String],
    projection: &str,
    geo_transform: &GeoTransform,
    no_data: Option<f64>,
) -> CalResult<()> {
    if bands.is_empty() {
        return Err(CalError::Processing("No bands to write".to_string()));
    }
    if descriptions.len() != bands.len() {
        return Err(CalError::Processing(format!(
            "{} band descriptions for {} bands",
            descriptions.len(),
            bands.len()
        )));
    }
    let (height, width) = bands[0].dim();
    if bands.iter().any(|b| b.dim() != (height, width)) {
        return Err(CalError::Processing("Bands differ in shape".to_string()));
    }

    log::info!("Writing {} band GeoTIFF to {}", bands.len(), path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "COMPRESS", value: "DEFLATE" },
        RasterCreationOption { key: "INTERLEAVE", value: "BAND" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        bands.len() as isize,
        &options,
    )?;

    dataset.set_geo_transform(&geo_transform.to_gdal())?;
    if !projection.is_empty() {
        dataset.set_projection(projection)?;
    }

    for (i, (data, description)) in bands.iter().zip(descriptions).enumerate() {
        let mut band = dataset.rasterband(i as isize + 1)?;
        band.set_description(description)?;
        band.set_no_data_value(no_data)?;
        let buffer = Buffer::new((width, height), data.iter().copied().collect::<Vec<f32>>());
        band.write((0, 0), (width, height), &buffer)?;
    }

    Ok(())
}
