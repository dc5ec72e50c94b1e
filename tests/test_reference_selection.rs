use chrono::NaiveDate;
use cropcal::core::{read_neighbor_archive, ReferenceSelectionParams, ReferenceSelector};
use cropcal::io::raster::{read_raster_info, read_raster_stack, scan_dated_rasters, write_geotiff};
use cropcal::types::{CalError, GeoTransform};
use ndarray::Array2;
use std::path::Path;

const SIZE: usize = 6;

fn geo_transform() -> GeoTransform {
    GeoTransform::from_gdal([500000.0, 10.0, 0.0, 4000060.0, 0.0, -10.0])
}

/// Acquisition with B04 and SCL bands on an arbitrary grid
fn write_scene(dir: &Path, name: &str, rows: usize, cols: usize, geo_transform: &GeoTransform, projection: &str) {
    let red = Array2::from_elem((rows, cols), 1500.0f32);
    let scl = Array2::from_elem((rows, cols), 8.0f32);
    write_geotiff(
        dir.join(name),
        &[red.view(), scl.view()],
        &["B04".to_string(), "SCL".to_string()],
        projection,
        geo_transform,
        None,
    )
    .expect("Failed to write scene");
}

/// One acquisition: the three western columns hold constant reflectance, the
/// eastern columns change with `drift` digital numbers per date
fn write_acquisition(dir: &Path, name: &str, drift: f32) {
    let red = Array2::from_shape_fn((SIZE, SIZE), |(_, c)| if c < 3 { 1200.0 } else { 1200.0 + drift });
    let nir = Array2::from_shape_fn((SIZE, SIZE), |(_, c)| if c < 3 { 3100.0 } else { 3100.0 - drift });
    let scl = Array2::from_elem((SIZE, SIZE), 8.0f32);
    let descriptions: Vec<String> = ["B04", "B08", "SCL"].iter().map(|s| s.to_string()).collect();

    write_geotiff(
        dir.join(name),
        &[red.view(), nir.view(), scl.view()],
        &descriptions,
        "",
        &geo_transform(),
        None,
    )
    .expect("Failed to write acquisition");
}

fn square(id: i64, cx: f64, cy: f64) -> String {
    let (x0, x1, y0, y1) = (cx - 5.0, cx + 5.0, cy - 5.0, cy + 5.0);
    format!(
        r#"{{"type": "Feature", "properties": {{"parcel_id": {}}}, "geometry": {{"type": "Polygon", "coordinates": [[[{x0}, {y0}], [{x1}, {y0}], [{x1}, {y1}], [{x0}, {y1}], [{x0}, {y0}]]]}}}}"#,
        id,
        x0 = x0,
        x1 = x1,
        y0 = y0,
        y1 = y1
    )
}

#[test]
fn test_reference_selection_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let scenes = dir.path().join("scenes");
    std::fs::create_dir(&scenes).expect("Failed to create scene directory");

    write_acquisition(&scenes, "S2_20200501_T31TCJ.tif", 0.0);
    write_acquisition(&scenes, "S2_20200511_T31TCJ.tif", 400.0);
    write_acquisition(&scenes, "S2_20200521_T31TCJ.tif", 900.0);
    // outside the date range: would destabilise every pixel if stacked
    let late = Array2::from_elem((SIZE, SIZE), 9000.0f32);
    let scl = Array2::from_elem((SIZE, SIZE), 8.0f32);
    write_geotiff(
        scenes.join("S2_20200901_T31TCJ.tif"),
        &[late.view(), late.view(), scl.view()],
        &["B04".to_string(), "B08".to_string(), "SCL".to_string()],
        "",
        &geo_transform(),
        None,
    )
    .expect("Failed to write late acquisition");

    // parcel 101 sits on pixel (1, 1); parcel 102 on pixel (5, 5) in the drifting half
    let parcels = dir.path().join("parcels.geojson");
    let collection = format!(
        r#"{{"type": "FeatureCollection", "features": [{}, {}]}}"#,
        square(101, 500015.0, 4000045.0),
        square(102, 500055.0, 4000005.0)
    );
    std::fs::write(&parcels, collection).expect("Failed to write parcels");

    let output = dir.path().join("references.npz");
    let std_output = dir.path().join("std.tif");
    let params = ReferenceSelectionParams {
        input_dir: scenes,
        parcels,
        bands: vec!["B04".to_string(), "B08".to_string()],
        start: NaiveDate::from_ymd_opt(2020, 4, 1),
        end: NaiveDate::from_ymd_opt(2020, 6, 30),
        std_threshold: 0.01,
        neighbors: 4,
        id_field: Some("parcel_id".to_string()),
        output: output.clone(),
        std_output: Some(std_output.clone()),
        ..ReferenceSelectionParams::default()
    };

    let selection = ReferenceSelector::new(params).run().expect("Reference selection failed");
    println!(
        "Selected {} references for {} parcels from {} dates",
        selection.table.num_neighbors(),
        selection.table.num_parcels(),
        selection.dates.len()
    );

    assert_eq!(selection.dates.len(), 3);
    assert_eq!(selection.stability.stable_count(), SIZE * 3);

    let table = read_neighbor_archive(&output).expect("Failed to read archive");
    assert_eq!(table.object_ids.to_vec(), vec![101, 102]);
    assert_eq!(table.grid_shape, (SIZE, SIZE));
    assert_eq!(table.num_neighbors(), 4);

    for i in 0..table.num_parcels() {
        let ranked: Vec<(i64, f64)> = table.neighbors(i).collect();
        assert!(ranked.windows(2).all(|w| w[0].1 <= w[1].1));
        for &(idx, d) in &ranked {
            assert!(d >= 0.0);
            let (_, col) = table.row_col(idx);
            assert!(col < 3, "unstable pixel {} selected", idx);
        }
    }

    let (first, d) = table.neighbors(0).next().expect("No neighbors for parcel 101");
    assert_eq!(table.row_col(first), (1, 1));
    assert!(d.abs() < 1e-6);

    let (first, d) = table.neighbors(1).next().expect("No neighbors for parcel 102");
    assert_eq!(table.row_col(first), (5, 2));
    assert!((d - 30.0).abs() < 1e-6);

    let info = read_raster_info(&std_output).expect("Failed to read std raster");
    assert_eq!(info.band_descriptions, vec!["std_B04", "std_B08", "stable", "valid_count"]);
}

#[test]
fn test_missing_band_fails_fast() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    write_acquisition(dir.path(), "S2_20200501.tif", 0.0);
    let parcels = dir.path().join("parcels.geojson");
    std::fs::write(
        &parcels,
        format!(r#"{{"type": "FeatureCollection", "features": [{}]}}"#, square(1, 500015.0, 4000045.0)),
    )
    .expect("Failed to write parcels");

    let params = ReferenceSelectionParams {
        input_dir: dir.path().to_path_buf(),
        parcels,
        bands: vec!["B04".to_string(), "B11".to_string()],
        output: dir.path().join("out.npz"),
        ..ReferenceSelectionParams::default()
    };
    let err = ReferenceSelector::new(params).run().unwrap_err();
    assert!(err.to_string().contains("B11"));
    assert!(!dir.path().join("out.npz").exists());
}

#[test]
fn test_grid_mismatch_fails_fast() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bands = vec!["B04".to_string()];

    let cases: Vec<(&str, usize, usize, GeoTransform, String)> = vec![
        ("smaller grid", 5, 6, geo_transform(), String::new()),
        (
            "shifted geotransform",
            SIZE,
            SIZE,
            GeoTransform::from_gdal([500020.0, 10.0, 0.0, 4000060.0, 0.0, -10.0]),
            String::new(),
        ),
        (
            "different projection",
            SIZE,
            SIZE,
            geo_transform(),
            gdal::spatial_ref::SpatialRef::from_epsg(32631)
                .and_then(|srs| srs.to_wkt())
                .expect("Failed to build UTM 31N WKT"),
        ),
    ];

    for (label, rows, cols, gt, projection) in cases {
        println!("Checking {}", label);
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        write_scene(dir.path(), "S2_20200501.tif", SIZE, SIZE, &geo_transform(), "");
        write_scene(dir.path(), "S2_20200511.tif", rows, cols, &gt, &projection);

        let rasters = scan_dated_rasters(dir.path(), None, None).expect("Failed to scan scenes");
        assert_eq!(rasters.len(), 2);

        let err = read_raster_stack(&rasters, &bands, "SCL").unwrap_err();
        assert!(matches!(err, CalError::GridMismatch(_)), "{}: unexpected error {}", label, err);
    }

    // identical grids stack fine
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    write_scene(dir.path(), "S2_20200501.tif", SIZE, SIZE, &geo_transform(), "");
    write_scene(dir.path(), "S2_20200511.tif", SIZE, SIZE, &geo_transform(), "");
    let rasters = scan_dated_rasters(dir.path(), None, None).expect("Failed to scan scenes");
    let stack = read_raster_stack(&rasters, &bands, "SCL").expect("Matching grids must stack");
    assert_eq!(stack.grid_shape(), (SIZE, SIZE));
}
