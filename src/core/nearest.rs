use crate::types::{CalError, CalResult, GeoTransform, Parcel};
use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Candidate reference pixels: linear indices into the raster grid and
/// the geographic coordinates of their centres
#[derive(Debug, Clone, Default)]
pub struct StablePixels {
    pub indices: Vec<usize>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl StablePixels {
    /// Collect the pixel centres of every `true` cell of `mask` in row-major order
    pub fn from_mask(mask: &Array2<bool>, geo_transform: &GeoTransform) -> Self {
        let (_, cols) = mask.dim();
        let mut pixels = StablePixels::default();
        for ((r, c), &stable) in mask.indexed_iter() {
            if stable {
                let (x, y) = geo_transform.pixel_centre(r, c);
                pixels.indices.push(r * cols + c);
                pixels.x.push(x);
                pixels.y.push(y);
            }
        }
        pixels
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Geographic (x, y) of every pixel centre of a `rows x cols` grid
pub fn pixel_centres(geo_transform: &GeoTransform, rows: usize, cols: usize) -> (Array2<f64>, Array2<f64>) {
    let mut xs = Array2::zeros((rows, cols));
    let mut ys = Array2::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let (x, y) = geo_transform.pixel_centre(r, c);
            xs[[r, c]] = x;
            ys[[r, c]] = y;
        }
    }
    (xs, ys)
}

/// Per-parcel ranked reference pixels
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborTable {
    pub object_ids: Array1<i64>,
    /// (parcel, rank) linear pixel index
    pub indices: Array2<i64>,
    /// (parcel, rank) Euclidean distance, ascending along each row
    pub distances: Array2<f64>,
    /// Raster (rows, cols) the linear indices refer to
    pub grid_shape: (usize, usize),
}

impl NeighborTable {
    pub fn num_parcels(&self) -> usize {
        self.object_ids.len()
    }

    /// Neighbors retained per parcel
    pub fn num_neighbors(&self) -> usize {
        self.indices.ncols()
    }

    /// (linear index, distance) pairs of parcel `i`, nearest first
    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.indices
            .row(i)
            .into_iter()
            .copied()
            .zip(self.distances.row(i).into_iter().copied())
    }

    /// Decode a linear pixel index into (row, col)
    pub fn row_col(&self, linear: i64) -> (usize, usize) {
        let cols = self.grid_shape.1.max(1);
        (linear as usize / cols, linear as usize % cols)
    }

    /// Persist as a compressed `.npz` archive
    pub fn write_npz<P: AsRef<Path>>(&self, path: P) -> CalResult<()> {
        log::info!(
            "Writing neighbor table ({} parcels x {} neighbors) to {}",
            self.num_parcels(),
            self.num_neighbors(),
            path.as_ref().display()
        );
        let shape = Array1::from(vec![self.grid_shape.0 as i64, self.grid_shape.1 as i64]);

        let mut writer = NpzWriter::new_compressed(File::create(path.as_ref())?);
        writer.add_array("object_ids", &self.object_ids)?;
        writer.add_array("distances", &self.distances)?;
        writer.add_array("indices", &self.indices)?;
        writer.add_array("shape", &shape)?;
        writer.finish()?;
        Ok(())
    }

    /// Load a table written by [`NeighborTable::write_npz`]
    pub fn read_npz<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let mut reader = NpzReader::new(File::open(path.as_ref())?)?;
        let names = reader.names()?;
        let entry = |name: &str| -> CalResult<String> {
            let npy = format!("{}.npy", name);
            names
                .iter()
                .find(|n| n.as_str() == name || n.as_str() == npy)
                .cloned()
                .ok_or_else(|| CalError::Archive(format!("Array {} missing from archive", name)))
        };

        let object_ids: Array1<i64> = reader.by_name(&entry("object_ids")?)?;
        let distances: Array2<f64> = reader.by_name(&entry("distances")?)?;
        let indices: Array2<i64> = reader.by_name(&entry("indices")?)?;
        let shape: Array1<i64> = reader.by_name(&entry("shape")?)?;

        if shape.len() != 2 || indices.dim() != distances.dim() || indices.nrows() != object_ids.len() {
            return Err(CalError::Archive("Inconsistent neighbor table arrays".to_string()));
        }

        Ok(Self {
            object_ids,
            indices,
            distances,
            grid_shape: (shape[0] as usize, shape[1] as usize),
        })
    }
}

pub fn write_neighbor_archive<P: AsRef<Path>>(path: P, table: &NeighborTable) -> CalResult<()> {
    table.write_npz(path)
}

pub fn read_neighbor_archive<P: AsRef<Path>>(path: P) -> CalResult<NeighborTable> {
    NeighborTable::read_npz(path)
}

/// The `k` pixels closest to (px, py) as (position in `pixels`, squared distance),
/// ascending by distance with ties broken by linear pixel index
fn k_nearest(px: f64, py: f64, pixels: &StablePixels, k: usize) -> Vec<(usize, f64)> {
    let mut ranked: Vec<(usize, f64)> = pixels
        .x
        .iter()
        .zip(&pixels.y)
        .enumerate()
        .map(|(i, (&x, &y))| {
            let dx = x - px;
            let dy = y - py;
            (i, dx * dx + dy * dy)
        })
        .collect();

    let order = |a: &(usize, f64), b: &(usize, f64)| -> Ordering {
        a.1.total_cmp(&b.1)
            .then_with(|| pixels.indices[a.0].cmp(&pixels.indices[b.0]))
    };

    if k < ranked.len() {
        ranked.select_nth_unstable_by(k - 1, order);
        ranked.truncate(k);
    }
    ranked.sort_by(order);
    ranked
}

/// Rank stable pixels by distance to each parcel centroid and keep the `n` nearest.
///
/// Every parcel gets `min(n, pixels.len())` neighbors so the table stays rectangular.
pub fn nearest_stable_pixels(
    parcels: &[Parcel],
    pixels: &StablePixels,
    n: usize,
    grid_shape: (usize, usize),
) -> CalResult<NeighborTable> {
    if n == 0 {
        return Err(CalError::Processing("Neighbor count must be at least 1".to_string()));
    }
    if pixels.is_empty() {
        return Err(CalError::Processing(
            "No temporally stable pixels to choose references from".to_string(),
        ));
    }

    let k = n.min(pixels.len());
    if k < n {
        log::warn!(
            "Only {} stable pixels available, keeping {} neighbors instead of {}",
            pixels.len(),
            k,
            n
        );
    }
    log::info!(
        "Searching {} nearest of {} stable pixels for {} parcels",
        k,
        pixels.len(),
        parcels.len()
    );

    #[cfg(feature = "parallel")]
    let ranked: Vec<Vec<(usize, f64)>> = parcels
        .par_iter()
        .map(|p| k_nearest(p.x, p.y, pixels, k))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let ranked: Vec<Vec<(usize, f64)>> = parcels
        .iter()
        .map(|p| k_nearest(p.x, p.y, pixels, k))
        .collect();

    let mut indices = Array2::<i64>::zeros((parcels.len(), k));
    let mut distances = Array2::<f64>::zeros((parcels.len(), k));
    for (i, row) in ranked.iter().enumerate() {
        for (j, &(pos, d2)) in row.iter().enumerate() {
            indices[[i, j]] = pixels.indices[pos] as i64;
            distances[[i, j]] = d2.sqrt();
        }
    }

    Ok(NeighborTable {
        object_ids: parcels.iter().map(|p| p.id).collect(),
        indices,
        distances,
        grid_shape,
    })
}
