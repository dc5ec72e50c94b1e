use crate::types::{CalError, CalResult};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// One displacement measurement of the GCP table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GcpRecord {
    /// Grid position of the sample
    pub grid_x: f64,
    pub grid_y: f64,
    /// Matched position in the target image
    pub observed_x: f64,
    pub observed_y: f64,
    /// Measured displacement
    pub disp_x: f64,
    pub disp_y: f64,
    /// Residual radius of the match
    pub radius: f64,
    /// 90th percentile radius of the match
    pub radius_90: f64,
}

impl GcpRecord {
    fn from_columns(cols: &[f64]) -> Self {
        Self {
            grid_x: cols[0],
            grid_y: cols[1],
            observed_x: cols[2],
            observed_y: cols[3],
            disp_x: cols[4],
            disp_y: cols[5],
            radius: cols[6],
            radius_90: cols[7],
        }
    }

    fn columns(&self) -> [f64; 8] {
        [
            self.grid_x,
            self.grid_y,
            self.observed_x,
            self.observed_y,
            self.disp_x,
            self.disp_y,
            self.radius,
            self.radius_90,
        ]
    }
}

/// Numeric layout of the written table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum TableFormat {
    /// `%8.1f` coordinates, `%8.3f` displacements and radii
    Plain,
    /// `%12.4f` coordinates, `%12.6f` displacements and radii
    Long,
    /// `%14.6e` for every column
    #[value(name = "exp", alias = "exponential")]
    Exponential,
}

impl FromStr for TableFormat {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(TableFormat::Plain),
            "long" => Ok(TableFormat::Long),
            "exp" | "exponential" => Ok(TableFormat::Exponential),
            _ => Err(CalError::InvalidFormat(format!("Unknown table format: {}", s))),
        }
    }
}

impl std::fmt::Display for TableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableFormat::Plain => write!(f, "plain"),
            TableFormat::Long => write!(f, "long"),
            TableFormat::Exponential => write!(f, "exp"),
        }
    }
}

/// Read a whitespace-delimited GCP table; `.gz` files are decompressed on the fly
pub fn read_gcp_table<P: AsRef<Path>>(path: P) -> CalResult<Vec<GcpRecord>> {
    let path = path.as_ref();
    log::info!("Reading GCP table from: {}", path.display());

    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().map_or(false, |e| e == "gz") {
        log::debug!("Decompressing gzipped table");
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let records = parse_gcp_table(BufReader::new(reader))?;
    log::info!("Read {} GCP records", records.len());
    Ok(records)
}

/// Parse GCP rows; blank lines and `#` comments are skipped
pub fn parse_gcp_table<R: BufRead>(reader: R) -> CalResult<Vec<GcpRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let cols = trimmed
            .split_whitespace()
            .map(|s| s.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| CalError::InvalidFormat(format!("Line {}: {}", line_no + 1, e)))?;

        if cols.len() < 8 {
            return Err(CalError::InvalidFormat(format!(
                "Line {}: expected 8 columns, found {}",
                line_no + 1,
                cols.len()
            )));
        }
        records.push(GcpRecord::from_columns(&cols));
    }
    Ok(records)
}

/// Python-style exponent notation (`1.234500e+02`), right-aligned in `width`
fn format_exp(value: f64, precision: usize, width: usize) -> String {
    let raw = format!("{:.*e}", precision, value);
    let formatted = match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => raw,
    };
    format!("{:>width$}", formatted, width = width)
}

/// Render one record in the requested layout
pub fn format_record(record: &GcpRecord, format: TableFormat) -> String {
    let cols = record.columns();
    let fields: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, &v)| match format {
            TableFormat::Plain if i < 4 => format!("{:8.1}", v),
            TableFormat::Plain => format!("{:8.3}", v),
            TableFormat::Long if i < 4 => format!("{:12.4}", v),
            TableFormat::Long => format!("{:12.6}", v),
            TableFormat::Exponential => format_exp(v, 6, 14),
        })
        .collect();
    fields.join(" ")
}

pub fn write_gcp_table<P: AsRef<Path>>(
    path: P,
    records: &[GcpRecord],
    format: TableFormat,
) -> CalResult<()> {
    log::info!(
        "Writing {} GCP records ({} format) to {}",
        records.len(),
        format,
        path.as_ref().display()
    );
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    for record in records {
        writeln!(writer, "{}", format_record(record, format))?;
    }
    writer.flush()?;
    Ok(())
}
