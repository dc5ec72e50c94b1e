//! Smooth a GCP displacement table and drop samples that disagree with the fit.

use anyhow::{Context, Result};
use clap::Parser;
use cropcal::{GcpSmoother, GcpSmoothingParams, TableFormat};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Filter GCP displacements against a smoothing spline fit")]
struct Args {
    /// Input GCP table (optionally gzip-compressed)
    input: PathBuf,

    /// Output GCP table
    output: PathBuf,

    /// Grid step along x
    #[arg(long)]
    xstp: f64,

    /// Grid step along y
    #[arg(long)]
    ystp: f64,

    /// Smoothing factor for the x displacement
    #[arg(long, default_value_t = 1.0)]
    smooth_x: f64,

    /// Smoothing factor for the y displacement
    #[arg(long, default_value_t = 1.0)]
    smooth_y: f64,

    /// Maximum absolute x residual
    #[arg(long, default_value_t = 1.0)]
    thr_x: f64,

    /// Maximum absolute y residual
    #[arg(long, default_value_t = 1.0)]
    thr_y: f64,

    /// Write fitted instead of measured displacements
    #[arg(long)]
    replace: bool,

    /// Grid cells per spline knot interval
    #[arg(long, default_value_t = 1)]
    knot_spacing: usize,

    /// Output number format
    #[arg(long, value_enum, default_value_t = TableFormat::Plain)]
    format: TableFormat,

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

    let params = GcpSmoothingParams {
        xstp: args.xstp,
        ystp: args.ystp,
        smooth_x: args.smooth_x,
        smooth_y: args.smooth_y,
        thr_x: args.thr_x,
        thr_y: args.thr_y,
        replace: args.replace,
        knot_spacing: args.knot_spacing,
        format: args.format,
    };
    log::debug!("Parameters: {:?}", params);

    let written = GcpSmoother::with_params(params)
        .run(&args.input, &args.output)
        .with_context(|| format!("Failed to smooth {}", args.input.display()))?;

    println!("Wrote {} GCPs to {}", written, args.output.display());
    Ok(())
}
