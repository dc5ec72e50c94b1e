use crate::core::nearest::{nearest_stable_pixels, write_neighbor_archive, NeighborTable, StablePixels};
use crate::core::stability::{StabilityFilter, StabilityParams, StabilityResult};
use crate::io::parcels::ParcelReader;
use crate::io::raster::{read_raster_stack, scan_dated_rasters, write_geotiff, DEFAULT_SCL_BAND};
use crate::types::{CalError, CalResult, Parcel, RasterStack, OUTPUT_NO_DATA};
use chrono::NaiveDate;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Reference pixel selection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSelectionParams {
    /// Directory of per-date resampled GeoTIFFs
    pub input_dir: PathBuf,
    /// Parcel polygons (any OGR vector format)
    pub parcels: PathBuf,
    /// Reflectance bands that must all be stable
    pub bands: Vec<String>,
    /// Scene classification band name
    pub scl_band: String,
    /// First acquisition date to use (inclusive)
    pub start: Option<NaiveDate>,
    /// Last acquisition date to use (inclusive)
    pub end: Option<NaiveDate>,
    pub std_threshold: f32,
    pub min_valid_dates: usize,
    /// Neighbors kept per parcel
    pub neighbors: usize,
    /// Integer attribute holding the parcel identifier
    pub id_field: Option<String>,
    /// Neighbor archive (`.npz`)
    pub output: PathBuf,
    /// Optional diagnostic GeoTIFF of the temporal std
    pub std_output: Option<PathBuf>,
}

impl Default for ReferenceSelectionParams {
    fn default() -> Self {
        let stability = StabilityParams::default();
        Self {
            input_dir: PathBuf::from("."),
            parcels: PathBuf::from("parcels.shp"),
            bands: vec!["B02".to_string(), "B03".to_string(), "B04".to_string(), "B08".to_string()],
            scl_band: DEFAULT_SCL_BAND.to_string(),
            start: None,
            end: None,
            std_threshold: stability.std_threshold,
            min_valid_dates: stability.min_valid_dates,
            neighbors: 50,
            id_field: None,
            output: PathBuf::from("reference_pixels.npz"),
            std_output: None,
        }
    }
}

impl ReferenceSelectionParams {
    pub fn stability_params(&self) -> StabilityParams {
        StabilityParams {
            std_threshold: self.std_threshold,
            min_valid_dates: self.min_valid_dates,
        }
    }
}

/// Everything a selection run produced
#[derive(Debug, Clone)]
pub struct ReferenceSelection {
    pub dates: Vec<NaiveDate>,
    pub stability: StabilityResult,
    pub table: NeighborTable,
}

/// Picks temporally stable reference pixels near each parcel
pub struct ReferenceSelector {
    params: ReferenceSelectionParams,
}

impl ReferenceSelector {
    pub fn new(params: ReferenceSelectionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ReferenceSelectionParams {
        &self.params
    }

    /// Run the full selection: scan, stack, filter, search, write
    pub fn run(&self) -> CalResult<ReferenceSelection> {
        let p = &self.params;
        if p.neighbors == 0 {
            return Err(CalError::Processing("Neighbor count must be at least 1".to_string()));
        }
        if let (Some(start), Some(end)) = (p.start, p.end) {
            if start > end {
                return Err(CalError::Processing(format!(
                    "Start date {} is after end date {}",
                    start, end
                )));
            }
        }

        log::info!("Step 1: Scanning acquisitions");
        let rasters = scan_dated_rasters(&p.input_dir, p.start, p.end)?;

        log::info!("Step 2: Reading raster stack");
        let stack = read_raster_stack(&rasters, &p.bands, &p.scl_band)?;

        log::info!("Step 3: Reading parcels");
        let parcels = ParcelReader::read_parcels(&p.parcels, p.id_field.as_deref())?;

        log::info!("Step 4: Selecting reference pixels");
        let (stability, table) = self.select_from_stack(&stack, &parcels)?;

        log::info!("Step 5: Writing results");
        write_neighbor_archive(&p.output, &table)?;
        if let Some(std_path) = &p.std_output {
            write_stability_geotiff(std_path, &stability, &stack)?;
        }

        log::info!(
            "Reference selection complete: {} parcels, {} neighbors each",
            table.num_parcels(),
            table.num_neighbors()
        );
        Ok(ReferenceSelection {
            dates: stack.dates,
            stability,
            table,
        })
    }

    /// Stability filtering and neighbor search on an already loaded stack
    pub fn select_from_stack(
        &self,
        stack: &RasterStack,
        parcels: &[Parcel],
    ) -> CalResult<(StabilityResult, NeighborTable)> {
        if parcels.is_empty() {
            return Err(CalError::Processing("No parcels to select references for".to_string()));
        }
        let filter = StabilityFilter::with_params(self.params.stability_params());
        let stability = filter.apply(stack)?;

        let pixels = StablePixels::from_mask(&stability.stable, &stack.geo_transform);
        let table = nearest_stable_pixels(parcels, &pixels, self.params.neighbors, stack.grid_shape())?;
        Ok((stability, table))
    }
}

/// Diagnostic raster: temporal std per band, the stability flag and the clear
/// observation count
pub fn write_stability_geotiff<P: AsRef<Path>>(
    path: P,
    result: &StabilityResult,
    stack: &RasterStack,
) -> CalResult<()> {
    let no_data = OUTPUT_NO_DATA as f32;
    let std_bands: Vec<Array2<f32>> = result
        .band_std
        .axis_iter(Axis(0))
        .map(|band| band.mapv(|v| if v.is_finite() { v } else { no_data }))
        .collect();
    let stable = result.stable.mapv(|s| if s { 1.0f32 } else { 0.0 });
    let count = result.valid_count.mapv(|n| n as f32);

    let mut bands: Vec<_> = std_bands.iter().map(|b| b.view()).collect();
    bands.push(stable.view());
    bands.push(count.view());

    let mut descriptions: Vec<String> = stack.band_names.iter().map(|b| format!("std_{}", b)).collect();
    descriptions.push("stable".to_string());
    descriptions.push("valid_count".to_string());

    write_geotiff(
        path,
        &bands,
        &descriptions,
        &stack.projection,
        &stack.geo_transform,
        Some(OUTPUT_NO_DATA),
    )
}
