use crate::types::{CalError, CalResult, Parcel};
use gdal::vector::{FieldValue, Geometry, LayerAccess};
use gdal::Dataset;
use std::path::Path;

/// Parcel reader for shapefiles and other OGR vector formats
pub struct ParcelReader;

impl ParcelReader {
    /// Read parcel centroids from the first layer of a vector file.
    ///
    /// Identifiers come from the integer attribute `id_field` when given, otherwise
    /// from the sequential feature index.
    pub fn read_parcels<P: AsRef<Path>>(path: P, id_field: Option<&str>) -> CalResult<Vec<Parcel>> {
        log::info!("Reading parcels from: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let mut layer = dataset.layer(0)?;

        let mut parcels = Vec::new();
        for (index, feature) in layer.features().enumerate() {
            let geometry = match feature.geometry() {
                Some(g) => g,
                None => {
                    log::warn!("Feature {} has no geometry, skipping", index);
                    continue;
                }
            };

            let (x, y) = match geometry_centroid(geometry) {
                Some(c) => c,
                None => {
                    log::warn!("Feature {} has an empty geometry, skipping", index);
                    continue;
                }
            };

            let id = match id_field {
                Some(name) => field_as_id(feature.field(name)?, name, index)?,
                None => index as i64,
            };

            parcels.push(Parcel { id, x, y });
        }

        if parcels.is_empty() {
            return Err(CalError::InvalidFormat(format!(
                "No parcels with geometry in {}",
                path.as_ref().display()
            )));
        }

        log::info!("Read {} parcels", parcels.len());
        Ok(parcels)
    }
}

fn field_as_id(value: Option<FieldValue>, name: &str, index: usize) -> CalResult<i64> {
    match value {
        Some(FieldValue::IntegerValue(v)) => Ok(v as i64),
        Some(FieldValue::Integer64Value(v)) => Ok(v),
        Some(FieldValue::RealValue(v)) if v.fract() == 0.0 => Ok(v as i64),
        Some(FieldValue::StringValue(s)) => s.trim().parse::<i64>().map_err(|_| {
            CalError::InvalidFormat(format!(
                "Field {} of feature {} is not an integer: {:?}",
                name, index, s
            ))
        }),
        Some(other) => Err(CalError::InvalidFormat(format!(
            "Field {} of feature {} is not an integer: {:?}",
            name, index, other
        ))),
        None => Err(CalError::InvalidFormat(format!(
            "Feature {} has no value for field {}",
            index, name
        ))),
    }
}

/// Centroid of a geometry: area-weighted for polygons, vertex mean otherwise
fn geometry_centroid(geometry: &Geometry) -> Option<(f64, f64)> {
    let mut rings = Vec::new();
    collect_outer_rings(geometry, &mut rings);
    let rings: Vec<_> = rings.into_iter().filter(|r| !r.points.is_empty()).collect();
    if rings.is_empty() {
        return None;
    }

    let mut area_sum = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for ring in rings.iter().filter(|r| r.exterior) {
        if let Some((a, x, y)) = ring_centroid(&ring.points) {
            area_sum += a;
            cx += a * x;
            cy += a * y;
        }
    }
    if area_sum.abs() > f64::EPSILON {
        return Some((cx / area_sum, cy / area_sum));
    }

    let points: Vec<&(f64, f64)> = rings.iter().flat_map(|r| r.points.iter()).collect();
    let n = points.len() as f64;
    Some((
        points.iter().map(|p| p.0).sum::<f64>() / n,
        points.iter().map(|p| p.1).sum::<f64>() / n,
    ))
}

/// Vertex run of a simple geometry; `exterior` marks polygon shells
struct Ring {
    points: Vec<(f64, f64)>,
    exterior: bool,
}

fn collect_outer_rings(geometry: &Geometry, rings: &mut Vec<Ring>) {
    let name = geometry.geometry_name().to_uppercase();
    let count = geometry.geometry_count();

    if count == 0 {
        rings.push(Ring {
            points: geometry.get_point_vec().into_iter().map(|(x, y, _)| (x, y)).collect(),
            exterior: false,
        });
    } else if name.ends_with("POLYGON") && !name.starts_with("MULTI") {
        // exterior ring only
        rings.push(Ring {
            points: geometry
                .get_geometry(0)
                .get_point_vec()
                .into_iter()
                .map(|(x, y, _)| (x, y))
                .collect(),
            exterior: true,
        });
    } else {
        for i in 0..count {
            collect_outer_rings(&geometry.get_geometry(i), rings);
        }
    }
}

/// Signed-area centroid of a closed ring via the shoelace formula.
/// Returns (|area|, cx, cy); `None` for degenerate rings.
fn ring_centroid(ring: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    if ring.len() < 3 {
        return None;
    }
    let mut a = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % ring.len()];
        let cross = x0 * y1 - x1 * y0;
        a += cross;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    if a.abs() < f64::EPSILON {
        return None;
    }
    let a = a * 0.5;
    Some((a.abs(), cx / (6.0 * a), cy / (6.0 * a)))
}
