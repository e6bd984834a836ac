//! Tiled retrieval of large remote composites
//!
//! The bounding box is split into an N x N grid, each cell fetched separately
//! with one coarser retry, and the tiles are stitched back into a single array.
//! Rows with any missing tile are dropped so the stitched array stays rectangular.

use crate::core::resample::resize_nearest;
use crate::io::raster::{write_geotiff, GeoTiffOptions};
use crate::types::{
    BiomassError, BiomassResult, BoundingBox, GeoRaster, GeoTransform, EPSG_WGS84, METERS_PER_DEGREE,
};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::path::Path;
use std::time::Duration;

/// One tile request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRequest {
    pub row: usize,
    pub col: usize,
    pub region: BoundingBox,
    /// Pixel size in meters
    pub scale_m: f64,
}

impl TileRequest {
    /// Shape (rows, cols) of this region at the request scale, at least 1x1
    pub fn expected_shape(&self) -> (usize, usize) {
        nominal_shape(&self.region, self.scale_m)
    }
}

/// Shape of `region` at `scale_m` meters per pixel
pub fn nominal_shape(region: &BoundingBox, scale_m: f64) -> (usize, usize) {
    let pixel_deg = scale_m / METERS_PER_DEGREE;
    let rows = ((region.height() / pixel_deg).round() as usize).max(1);
    let cols = ((region.width() / pixel_deg).round() as usize).max(1);
    (rows, cols)
}

/// A remote service able to return one band over a region
pub trait TileSource {
    fn fetch(&self, request: &TileRequest) -> BiomassResult<Array2<f32>>;
}

impl<F> TileSource for F
where
    F: Fn(&TileRequest) -> BiomassResult<Array2<f32>>,
{
    fn fetch(&self, request: &TileRequest) -> BiomassResult<Array2<f32>> {
        self(request)
    }
}

/// Result of fetching one tile
#[derive(Debug, Clone, PartialEq)]
pub enum TileOutcome {
    Fetched,
    /// Fetched only at the coarser retry scale
    Degraded { scale_m: f64 },
    Missing { error: String },
}

/// Per-tile outcomes of one retrieval
#[derive(Debug, Clone, Default)]
pub struct RetrievalReport {
    /// (row, col, outcome) in request order
    pub tiles: Vec<(usize, usize, TileOutcome)>,
    /// Grid rows left out of the stitched array
    pub dropped_rows: Vec<usize>,
}

impl RetrievalReport {
    pub fn fetched(&self) -> usize {
        self.count(|o| matches!(o, TileOutcome::Fetched))
    }

    pub fn degraded(&self) -> usize {
        self.count(|o| matches!(o, TileOutcome::Degraded { .. }))
    }

    pub fn missing(&self) -> usize {
        self.count(|o| matches!(o, TileOutcome::Missing { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }

    fn count(&self, pred: impl Fn(&TileOutcome) -> bool) -> usize {
        self.tiles.iter().filter(|(_, _, o)| pred(o)).count()
    }
}

/// Stitched result of a tiled retrieval
#[derive(Debug, Clone)]
pub struct RetrievedRaster {
    pub raster: GeoRaster,
    pub report: RetrievalReport,
}

/// Fetches a region as an N x N grid of tiles
#[derive(Debug, Clone)]
pub struct TiledRetriever {
    pub grid_size: usize,
    /// Pause between consecutive tile requests
    pub pause: Duration,
    /// Multiplier applied to the scale for the single retry
    pub retry_scale_factor: f64,
}

impl Default for TiledRetriever {
    fn default() -> Self {
        Self {
            grid_size: 4,
            pause: Duration::from_secs(1),
            retry_scale_factor: 2.0,
        }
    }
}

impl TiledRetriever {
    pub fn new(grid_size: usize, pause: Duration) -> Self {
        Self {
            grid_size: grid_size.max(1),
            pause,
            ..Default::default()
        }
    }

    /// Fetch every tile and stitch them into one raster.
    ///
    /// The transform of the result is anchored at the north-west corner of
    /// `bbox`; dropped rows shorten the raster without shifting that anchor.
    pub fn retrieve<S: TileSource + ?Sized>(
        &self,
        source: &S,
        bbox: &BoundingBox,
        scale_m: f64,
    ) -> BiomassResult<RetrievedRaster> {
        if !bbox.is_valid() {
            return Err(BiomassError::Processing(format!("Invalid bounding box: {:?}", bbox)));
        }
        if !(scale_m.is_finite() && scale_m > 0.0) {
            return Err(BiomassError::Processing(format!("Invalid scale: {}", scale_m)));
        }

        let cells = bbox.partition(self.grid_size);
        log::info!(
            "Retrieving {} tiles ({}x{} grid) at {} m",
            cells.len(),
            self.grid_size,
            self.grid_size,
            scale_m
        );

        let mut report = RetrievalReport::default();
        let mut tiles: Vec<Vec<Option<Array2<f32>>>> = vec![vec![None; self.grid_size]; self.grid_size];

        for (i, (row, col, region)) in cells.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                std::thread::sleep(self.pause);
            }

            let request = TileRequest {
                row: *row,
                col: *col,
                region: *region,
                scale_m,
            };
            let (data, outcome) = self.fetch_tile(source, &request);
            tiles[*row][*col] = data;
            report.tiles.push((*row, *col, outcome));
        }

        if report.fetched() + report.degraded() == 0 {
            return Err(BiomassError::NoTiles(format!("{:?}", bbox)));
        }
        let data = Self::stitch(&tiles, &mut report)?;
        if data.is_empty() {
            return Err(BiomassError::NoTiles(format!(
                "{:?}: every grid row has a missing tile (dropped rows {:?})",
                bbox, report.dropped_rows
            )));
        }

        let pixel_deg = scale_m / METERS_PER_DEGREE;
        let transform = GeoTransform::north_up(bbox, pixel_deg);

        log::info!(
            "Retrieved {}x{} raster: {} fetched, {} degraded, {} missing tiles",
            data.nrows(),
            data.ncols(),
            report.fetched(),
            report.degraded(),
            report.missing()
        );

        Ok(RetrievedRaster {
            raster: GeoRaster::new(data, transform, EPSG_WGS84),
            report,
        })
    }

    /// Retrieve and write the stitched raster as a GeoTIFF
    pub fn retrieve_to_file<S: TileSource + ?Sized, P: AsRef<Path>>(
        &self,
        source: &S,
        bbox: &BoundingBox,
        scale_m: f64,
        output_path: P,
    ) -> BiomassResult<RetrievalReport> {
        let retrieved = self.retrieve(source, bbox, scale_m)?;
        write_geotiff(&retrieved.raster, output_path, Some(&GeoTiffOptions::default()))?;
        Ok(retrieved.report)
    }

    /// One attempt at the nominal scale, one retry at the coarser scale
    fn fetch_tile<S: TileSource + ?Sized>(
        &self,
        source: &S,
        request: &TileRequest,
    ) -> (Option<Array2<f32>>, TileOutcome) {
        let nominal = request.expected_shape();

        match source.fetch(request) {
            Ok(data) => {
                log::debug!("Tile ({}, {}) fetched: {:?}", request.row, request.col, data.dim());
                return (Some(Self::normalize(data, nominal)), TileOutcome::Fetched);
            }
            Err(e) => {
                log::warn!(
                    "Tile ({}, {}) failed at {} m: {}; retrying at coarser scale",
                    request.row,
                    request.col,
                    request.scale_m,
                    e
                );
            }
        }

        let retry = TileRequest {
            scale_m: request.scale_m * self.retry_scale_factor,
            ..*request
        };
        match source.fetch(&retry) {
            Ok(data) => {
                log::info!(
                    "Tile ({}, {}) fetched at degraded scale {} m",
                    request.row,
                    request.col,
                    retry.scale_m
                );
                (
                    Some(Self::normalize(data, nominal)),
                    TileOutcome::Degraded { scale_m: retry.scale_m },
                )
            }
            Err(e) => {
                log::warn!("Tile ({}, {}) missing: {}", request.row, request.col, e);
                (None, TileOutcome::Missing { error: e.to_string() })
            }
        }
    }

    fn normalize(data: Array2<f32>, shape: (usize, usize)) -> Array2<f32> {
        if data.dim() == shape {
            data
        } else {
            resize_nearest(&data, shape)
        }
    }

    /// Concatenate complete rows horizontally, then stack them vertically
    fn stitch(
        tiles: &[Vec<Option<Array2<f32>>>],
        report: &mut RetrievalReport,
    ) -> BiomassResult<Array2<f32>> {
        let mut rows = Vec::new();

        for (row_index, row) in tiles.iter().enumerate() {
            let complete: Option<Vec<ArrayView2<f32>>> =
                row.iter().map(|t| t.as_ref().map(|a| a.view())).collect();

            match complete {
                Some(views) => rows.push(concatenate(Axis(1), &views)?),
                None => {
                    log::warn!("Dropping grid row {}: at least one tile is missing", row_index);
                    report.dropped_rows.push(row_index);
                }
            }
        }

        if rows.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }

        let views: Vec<ArrayView2<f32>> = rows.iter().map(|r| r.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn constant_source(request: &TileRequest) -> BiomassResult<Array2<f32>> {
        Ok(Array2::from_elem(request.expected_shape(), (request.row * 10 + request.col) as f32))
    }

    #[test]
    fn test_nominal_shape_minimum_one() {
        let tiny = BoundingBox::new(0.0, 1e-6, 0.0, 1e-6);
        assert_eq!(nominal_shape(&tiny, 100.0), (1, 1));
    }

    #[test]
    fn test_full_retrieval_places_tiles_in_order() {
        let retriever = TiledRetriever::new(2, Duration::ZERO);
        let bbox = BoundingBox::new(0.0, 0.02, 0.0, 0.02);
        let result = retriever.retrieve(&constant_source, &bbox, 1000.0).unwrap();

        let tile = nominal_shape(&bbox.partition(2)[0].2, 1000.0);
        assert_eq!(result.raster.shape(), (tile.0 * 2, tile.1 * 2));
        assert_eq!(result.raster.data[[0, 0]], 0.0);
        assert_eq!(result.raster.data[[0, tile.1]], 1.0);
        assert_eq!(result.raster.data[[tile.0, 0]], 10.0);
        assert_eq!(result.report.fetched(), 4);
        assert!(result.report.is_complete());
    }

    #[test]
    fn test_degraded_tile_is_resized_to_nominal_shape() {
        let retriever = TiledRetriever::new(2, Duration::ZERO);
        let bbox = BoundingBox::new(0.0, 0.02, 0.0, 0.02);
        let nominal = 1000.0;

        let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
            if request.row == 1 && request.col == 1 && request.scale_m == nominal {
                return Err(BiomassError::Processing("too many pixels".to_string()));
            }
            Ok(Array2::from_elem(request.expected_shape(), 5.0))
        };

        let result = retriever.retrieve(&source, &bbox, nominal).unwrap();
        assert_eq!(result.report.degraded(), 1);
        assert_eq!(
            result.report.tiles[3].2,
            TileOutcome::Degraded { scale_m: 2000.0 }
        );
        let tile = nominal_shape(&bbox.partition(2)[0].2, nominal);
        assert_eq!(result.raster.shape(), (tile.0 * 2, tile.1 * 2));
    }

    #[test]
    fn test_retry_happens_exactly_once() {
        let calls = RefCell::new(Vec::new());
        let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
            calls.borrow_mut().push(request.scale_m);
            Err(BiomassError::Processing("service unavailable".to_string()))
        };

        let retriever = TiledRetriever::new(1, Duration::ZERO);
        let bbox = BoundingBox::new(0.0, 0.01, 0.0, 0.01);
        let err = retriever.retrieve(&source, &bbox, 30.0).unwrap_err();

        assert!(matches!(err, BiomassError::NoTiles(_)));
        assert_eq!(*calls.borrow(), vec![30.0, 60.0]);
    }

    #[test]
    fn test_failed_row_is_dropped() {
        let retriever = TiledRetriever::new(3, Duration::ZERO);
        let bbox = BoundingBox::new(0.0, 0.03, 0.0, 0.03);

        let source = |request: &TileRequest| -> BiomassResult<Array2<f32>> {
            if request.row == 1 && request.col == 2 {
                return Err(BiomassError::Processing("timeout".to_string()));
            }
            Ok(Array2::from_elem(request.expected_shape(), request.row as f32))
        };

        let result = retriever.retrieve(&source, &bbox, 1000.0).unwrap();
        let cells = bbox.partition(3);
        let height_of = |row: usize| nominal_shape(&cells[row * 3].2, 1000.0).0;

        assert_eq!(result.report.dropped_rows, vec![1]);
        assert_eq!(result.report.missing(), 1);
        assert_eq!(result.raster.shape().0, height_of(0) + height_of(2));
        // Row 2 data follows row 0 directly
        assert_eq!(result.raster.data[[height_of(0), 0]], 2.0);
    }
}
