use biomap::core::tiling::{nominal_shape, TileOutcome, TileRequest, TiledRetriever};
use biomap::types::{BiomassError, BiomassResult, BoundingBox};
use ndarray::Array2;
use std::cell::RefCell;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn study_area() -> BoundingBox {
    BoundingBox::new(107.0, 108.0, 13.0, 14.0)
}

#[test]
fn test_two_by_two_grid_requests_each_cell_once() {
    init_logging();
    let requests = RefCell::new(Vec::new());
    let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
        requests.borrow_mut().push(*request);
        Ok(Array2::from_elem(request.expected_shape(), 1.0))
    };

    let retriever = TiledRetriever::new(2, Duration::ZERO);
    let result = retriever.retrieve(&source, &study_area(), 90.0).unwrap();

    let requests = requests.into_inner();
    assert_eq!(requests.len(), 4);
    for request in &requests {
        assert!((request.region.width() - 0.5).abs() < 1e-12);
        assert!((request.region.height() - 0.5).abs() < 1e-12);
        assert_eq!(request.scale_m, 90.0);
    }
    // Row 0 is the northern half
    assert_eq!(requests[0].region.max_lat, 14.0);
    assert_eq!(requests[3].region.min_lat, 13.0);
    assert_eq!(requests[3].region.max_lon, 108.0);

    let cell = nominal_shape(&requests[0].region, 90.0);
    assert_eq!(result.raster.shape(), (cell.0 * 2, cell.1 * 2));
    assert_eq!(result.raster.transform.top_left_x, 107.0);
    assert_eq!(result.raster.transform.top_left_y, 14.0);
    assert_eq!(result.report.fetched(), 4);
}

#[test]
fn test_failed_tile_retried_at_double_scale() {
    init_logging();
    let scales = RefCell::new(Vec::new());
    let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
        if (request.row, request.col) == (1, 1) {
            scales.borrow_mut().push(request.scale_m);
            if request.scale_m < 2000.0 {
                return Err(BiomassError::Processing("request too large".to_string()));
            }
        }
        Ok(Array2::from_elem(request.expected_shape(), 5.0))
    };

    let retriever = TiledRetriever::new(2, Duration::ZERO);
    let result = retriever.retrieve(&source, &study_area(), 1000.0).unwrap();

    assert_eq!(scales.into_inner(), vec![1000.0, 2000.0]);
    assert_eq!(result.report.degraded(), 1);
    assert!(result
        .report
        .tiles
        .iter()
        .any(|(r, c, o)| (*r, *c) == (1, 1) && *o == TileOutcome::Degraded { scale_m: 2000.0 }));

    // Degraded tile is brought back to the nominal cell size
    let cell = nominal_shape(&study_area().partition(2)[0].2, 1000.0);
    assert_eq!(result.raster.shape(), (cell.0 * 2, cell.1 * 2));
    assert_eq!(result.raster.data[[cell.0 * 2 - 1, cell.1 * 2 - 1]], 5.0);
}

#[test]
fn test_row_with_missing_tile_is_dropped() {
    init_logging();
    let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
        if (request.row, request.col) == (0, 1) {
            return Err(BiomassError::Processing("timeout".to_string()));
        }
        Ok(Array2::from_elem(request.expected_shape(), request.row as f32))
    };

    let retriever = TiledRetriever::new(2, Duration::ZERO);
    let result = retriever.retrieve(&source, &study_area(), 1000.0).unwrap();

    let cell = nominal_shape(&study_area().partition(2)[0].2, 1000.0);
    assert_eq!(result.report.missing(), 1);
    assert_eq!(result.report.dropped_rows, vec![0]);
    assert!(!result.report.is_complete());
    assert_eq!(result.raster.shape(), (cell.0, cell.1 * 2));
    assert!(result.raster.data.iter().all(|&v| v == 1.0));
}

#[test]
fn test_nothing_fetched_is_an_error() {
    init_logging();
    let source = |_: &TileRequest| -> BiomassResult<Array2<f32>> { Err(BiomassError::Processing("down".to_string())) };

    let retriever = TiledRetriever::new(2, Duration::ZERO);
    let err = retriever.retrieve(&source, &study_area(), 1000.0).unwrap_err();
    assert!(matches!(err, BiomassError::NoTiles(_)));
}

#[test]
fn test_every_row_dropped_is_an_error() {
    init_logging();
    // Tiles on the anti-diagonal fail at both scales
    let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
        if request.row + request.col == 1 {
            return Err(BiomassError::Processing("timeout".to_string()));
        }
        Ok(Array2::from_elem(request.expected_shape(), 1.0))
    };

    let retriever = TiledRetriever::new(2, Duration::ZERO);
    let err = retriever.retrieve(&source, &study_area(), 1000.0).unwrap_err();
    assert!(matches!(err, BiomassError::NoTiles(_)), "{:?}", err);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agbd.tif");
    let err = retriever.retrieve_to_file(&source, &study_area(), 1000.0, &path).unwrap_err();
    assert!(matches!(err, BiomassError::NoTiles(_)));
    assert!(!path.exists());
}

#[test]
fn test_retrieve_to_file_writes_geotiff() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agbd.tif");
    let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
        Ok(Array2::from_elem(request.expected_shape(), 42.0))
    };

    let bbox = BoundingBox::new(107.0, 107.1, 13.0, 13.1);
    let report = TiledRetriever::new(2, Duration::ZERO)
        .retrieve_to_file(&source, &bbox, 1000.0, &path)
        .unwrap();
    assert!(report.is_complete());

    let raster = biomap::io::raster::read_geotiff(&path, 1).unwrap();
    assert_eq!(raster.data[[0, 0]], 42.0);
    assert!((raster.transform.top_left_x - 107.0).abs() < 1e-9);
}
