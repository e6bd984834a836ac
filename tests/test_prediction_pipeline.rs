use biomap::config::{BoundaryConfig, ModelConfig, PipelineConfig, SourceSpec};
use biomap::core::features::FeatureAssembler;
use biomap::core::forest::{ForestParams, RandomForestRegressor};
use biomap::core::prediction::{BlockPredictor, ExclusionRule};
use biomap::core::training::ModelTrainer;
use biomap::io::raster::{read_geotiff, write_geotiff};
use biomap::io::results::{total_biomass, ResultWriter, SummaryMetrics, SUMMARY_FILE};
use biomap::core::tiling::{TileRequest, TileSource};
use biomap::types::{BiomassResult, BoundingBox, GeoRaster, GeoTransform, GridSpec, EPSG_WGS84};
use biomap::Pipeline;
use ndarray::Array2;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const N: usize = 30;

fn grid() -> GridSpec {
    GridSpec::for_bbox(&BoundingBox::new(107.0, 107.0 + N as f64 * 0.001, 13.0, 13.0 + N as f64 * 0.001), 111.325)
}

fn layer(grid: &GridSpec, f: impl Fn(usize, usize) -> f32) -> GeoRaster {
    GeoRaster::new(Array2::from_shape_fn(grid.shape, |(r, c)| f(r, c)), grid.transform, EPSG_WGS84)
}

/// ndvi rises west to east, the top five rows are steep, one pixel has no ndvi
fn synthetic_layers(grid: &GridSpec) -> (Vec<(String, GeoRaster)>, GeoRaster) {
    let ndvi = layer(grid, |r, c| if (r, c) == (10, 10) { f32::NAN } else { c as f32 / N as f32 });
    let dem = layer(grid, |r, _| 100.0 + r as f32);
    let slope = layer(grid, |r, _| if r < 5 { 45.0 } else { 5.0 });
    let target = layer(grid, |r, c| {
        if (r + c) % 7 == 0 {
            f32::NAN
        } else {
            20.0 + 200.0 * c as f32 / N as f32
        }
    });

    (
        vec![
            ("slope".to_string(), slope),
            ("ndvi".to_string(), ndvi),
            ("dem".to_string(), dem),
        ],
        target,
    )
}

fn trainer(cap: usize) -> ModelTrainer<RandomForestRegressor> {
    let forest = RandomForestRegressor::new(ForestParams {
        n_trees: 20,
        ..Default::default()
    });
    ModelTrainer::new(forest, cap, 42)
}

#[test]
fn test_train_and_predict_synthetic_stack() {
    init_logging();
    let grid = grid();
    assert_eq!(grid.shape, (N, N));

    let (layers, target) = synthetic_layers(&grid);
    let stack = FeatureAssembler::new(grid).assemble(layers, Some(target), None).unwrap();
    assert_eq!(stack.names, vec!["ndvi", "dem", "slope"]);

    let trained = trainer(100_000).train(&stack).unwrap();
    assert_eq!(trained.report.n_training, stack.usable_pixels().len());
    assert!(trained.report.rmse < 15.0, "rmse {}", trained.report.rmse);

    let predictor = BlockPredictor::new(8, Some(ExclusionRule::slope_above(30.0)));
    let (prediction, stats) = predictor.predict(&trained.model, &stack).unwrap();

    for ((r, c), &v) in prediction.data.indexed_iter() {
        if r < 5 || (r, c) == (10, 10) {
            assert!(v.is_nan(), "pixel ({}, {}) should not be predicted", r, c);
        } else {
            assert!(v.is_finite(), "pixel ({}, {}) should be predicted", r, c);
        }
    }
    assert_eq!(stats.excluded, 5 * N);
    assert_eq!(stats.incomplete, 1);
    assert_eq!(stats.predicted, N * N - 5 * N - 1);
    assert_eq!(stats.blocks, 16);

    // East side carries more biomass than west
    assert!(prediction.data[[20, N - 1]] > prediction.data[[20, 0]]);
}

#[test]
fn test_sample_cap_draws_unique_pixels() {
    init_logging();
    let grid = grid();
    let (layers, target) = synthetic_layers(&grid);
    let stack = FeatureAssembler::new(grid).assemble(layers, Some(target), None).unwrap();

    let sample = trainer(100).sample(&stack).unwrap();
    assert_eq!(sample.len(), 100);
    assert_eq!(sample.pixels.iter().collect::<HashSet<_>>().len(), 100);
    for &(r, c) in &sample.pixels {
        assert!(stack.target_value(r, c).is_some());
        assert!(stack.feature_vector(r, c).is_some());
    }
}

#[test]
fn test_summary_written_to_output_dir() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let grid = grid();
    let (layers, target) = synthetic_layers(&grid);
    let stack = FeatureAssembler::new(grid).assemble(layers, Some(target), None).unwrap();

    let trained = trainer(500).train(&stack).unwrap();
    let (prediction, stats) = BlockPredictor::default().predict(&trained.model, &stack).unwrap();
    let total = total_biomass(&prediction, None).unwrap();
    assert!(total > 0.0);

    let metrics = SummaryMetrics::new(&trained.report, &stats, total);
    let outputs = ResultWriter::new(dir.path())
        .write_all(&prediction, &metrics, &trained.report.pairs)
        .unwrap();

    let summary = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
    let mut lines = summary.lines();
    assert_eq!(lines.next(), Some("Metric,Value"));
    assert!(lines.next().unwrap().starts_with("RMSE,"));
    assert!(summary.contains("Total_Biomass_Mg,"));
    assert!(outputs.scatter_png.unwrap().exists());

    let written = read_geotiff(&outputs.prediction, 1).unwrap();
    assert_eq!(written.shape(), (N, N));
    assert!(written.data[[0, 0]].is_nan());
}

fn write_band(dir: &Path, name: &str, transform: GeoTransform, data: Array2<f32>) -> std::path::PathBuf {
    let path = dir.join(format!("{}.tif", name));
    write_geotiff(&GeoRaster::new(data, transform, EPSG_WGS84), &path, None).unwrap();
    path
}

/// Reflectance of the synthetic study area at grid pixel (r, c)
fn optical_value(band: &str, r: usize, c: usize) -> f32 {
    match band {
        "B2" => 0.04,
        "B3" => 0.06,
        "B4" => 0.05 + 0.005 * r as f32,
        "B8" => 0.2 + 0.03 * c as f32,
        _ => 0.2,
    }
}

const OPTICAL_BANDS: [&str; 5] = ["B2", "B3", "B4", "B8", "B11"];

/// Boundary, elevation and reference files over a 10 x 10 grid at 1 km
fn study_inputs(dir: &Path) -> (GridSpec, PipelineConfig) {
    let inputs = dir.join("inputs");
    std::fs::create_dir_all(&inputs).unwrap();

    let bbox = BoundingBox::new(107.0, 107.09, 13.0, 13.09);
    let grid = GridSpec::for_bbox(&bbox, 1000.0);
    assert_eq!(grid.shape, (10, 10));
    let field = |f: &dyn Fn(usize, usize) -> f32| Array2::from_shape_fn(grid.shape, |(r, c)| f(r, c));

    let boundary = inputs.join("aoi.geojson");
    std::fs::write(
        &boundary,
        r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},"geometry":
            {"type":"Polygon","coordinates":[[[107.0,13.0],[107.09,13.0],[107.09,13.09],[107.0,13.09],[107.0,13.0]]]}}]}"#,
    )
    .unwrap();

    let mut elevation = BTreeMap::new();
    elevation.insert("dem".to_string(), write_band(&inputs, "dem", grid.transform, field(&|r, _| 50.0 + 2.0 * r as f32)));

    let mut reference = BTreeMap::new();
    reference.insert(
        "agbd".to_string(),
        write_band(&inputs, "agbd", grid.transform, field(&|_, c| 30.0 + 15.0 * c as f32)),
    );

    let config = PipelineConfig {
        boundary: BoundaryConfig {
            local_path: Some(boundary),
            remote_url: None,
        },
        scale_m: 1000.0,
        elevation: SourceSpec::Files { bands: elevation },
        reference: SourceSpec::Files { bands: reference },
        work_dir: dir.join("work"),
        output_dir: dir.join("results"),
        model: ModelConfig {
            n_trees: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    (grid, config)
}

#[test]
fn test_pipeline_runs_on_exported_files() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (grid, mut config) = study_inputs(dir.path());

    let inputs = dir.path().join("inputs");
    let optical: BTreeMap<String, PathBuf> = OPTICAL_BANDS
        .iter()
        .map(|&band| {
            let data = Array2::from_shape_fn(grid.shape, |(r, c)| optical_value(band, r, c));
            (band.to_string(), write_band(&inputs, band, grid.transform, data))
        })
        .collect();
    config.optical = SourceSpec::Files { bands: optical };

    let summary = Pipeline::new(config).unwrap().run().unwrap();

    assert_eq!(summary.grid.shape, (10, 10));
    assert_eq!(summary.feature_names.first().map(String::as_str), Some("B2"));
    assert_eq!(summary.feature_names.last().map(String::as_str), Some("slope"));
    assert!(summary.feature_names.iter().any(|n| n == "ndvi"));
    assert!(summary.feature_names.iter().any(|n| n == "evi"));
    assert_eq!(summary.training.n_training, 100);
    assert_eq!(summary.prediction.predicted, 100);
    assert!(summary.total_biomass_mg > 0.0);
    assert!(summary.retrievals.is_empty());
    assert!(summary.outputs.prediction.exists());
    assert!(summary.outputs.summary.exists());
    assert!(summary.outputs.map_png.exists());
}

#[test]
fn test_remote_optical_bands_get_standard_indices() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (_, mut config) = study_inputs(dir.path());
    config.optical = SourceSpec::Remote {
        endpoint: "https://tiles.example.org/export".to_string(),
        image: "S2_SR_median".to_string(),
        bands: OPTICAL_BANDS.iter().map(|b| b.to_string()).collect(),
    };
    config.retrieval.grid_size = 2;
    config.retrieval.pause_ms = 0;

    let requested = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requested);
    let factory = move |endpoint: &str, image: &str, band: &str| -> BiomassResult<Box<dyn TileSource>> {
        assert_eq!(endpoint, "https://tiles.example.org/export");
        assert_eq!(image, "S2_SR_median");
        log.lock().unwrap().push(band.to_string());

        let band = band.to_string();
        Ok(Box::new(move |request: &TileRequest| -> BiomassResult<Array2<f32>> {
            let (rows, cols) = request.expected_shape();
            Ok(Array2::from_shape_fn((rows, cols), |(i, j)| {
                optical_value(&band, request.row * rows + i, request.col * cols + j)
            }))
        }))
    };

    let summary = Pipeline::new(config).unwrap().with_tile_sources(factory).run().unwrap();

    assert_eq!(*requested.lock().unwrap(), OPTICAL_BANDS.to_vec());
    for index in ["ndvi", "mndwi", "ndbi", "evi"] {
        assert!(
            summary.feature_names.iter().any(|n| n == index),
            "{} missing from {:?}",
            index,
            summary.feature_names
        );
    }
    assert_eq!(summary.retrievals.len(), OPTICAL_BANDS.len());
    assert!(summary.retrievals.values().all(|r| r.is_complete() && r.fetched() == 4));
    assert!(summary.retrievals.contains_key("optical_B8"));
    assert!(dir.path().join("work").join("optical_B8.tif").exists());
    assert_eq!(summary.training.n_training, 100);
    assert_eq!(summary.prediction.predicted, 100);
}
