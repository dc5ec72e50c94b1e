//! Select temporally stable reference pixels for every parcel of a vector file.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use cropcal::{ReferenceSelectionParams, ReferenceSelector};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Select temporally stable reference pixels near each parcel")]
struct Args {
    /// Directory of per-date resampled GeoTIFFs (YYYYMMDD in the file name)
    #[arg(long)]
    input_dir: PathBuf,

    /// Parcel polygons (shapefile or any OGR vector format)
    #[arg(long)]
    parcels: PathBuf,

    /// Comma-separated reflectance band names
    #[arg(long, value_delimiter = ',', default_value = "B02,B03,B04,B08")]
    bands: Vec<String>,

    /// First acquisition date (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last acquisition date (YYYY-MM-DD)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Maximum temporal standard deviation of a stable pixel
    #[arg(long, default_value_t = 0.01)]
    std_threshold: f32,

    /// Reference pixels kept per parcel
    #[arg(long, default_value_t = 50)]
    neighbors: usize,

    /// Output neighbor archive (.npz)
    #[arg(long)]
    output: PathBuf,

    /// Integer attribute holding the parcel identifier
    #[arg(long)]
    id_field: Option<String>,

    /// Scene classification band name
    #[arg(long, default_value = "SCL")]
    scl_band: String,

    /// Minimum clear observations per pixel
    #[arg(long, default_value_t = 1)]
    min_valid_dates: usize,

    /// Optional diagnostic GeoTIFF of the temporal std
    #[arg(long)]
    std_output: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let params = ReferenceSelectionParams {
        input_dir: args.input_dir,
        parcels: args.parcels,
        bands: args.bands,
        scl_band: args.scl_band,
        start: args.start,
        end: args.end,
        std_threshold: args.std_threshold,
        min_valid_dates: args.min_valid_dates,
        neighbors: args.neighbors,
        id_field: args.id_field,
        output: args.output,
        std_output: args.std_output,
    };
    log::debug!("Parameters: {:?}", params);

    let output = params.output.clone();
    let selection = ReferenceSelector::new(params)
        .run()
        .context("Reference pixel selection failed")?;

    println!(
        "Wrote {} parcels x {} reference pixels to {} ({} stable pixels over {} dates)",
        selection.table.num_parcels(),
        selection.table.num_neighbors(),
        output.display(),
        selection.stability.stable_count(),
        selection.dates.len()
    );
    Ok(())
}
