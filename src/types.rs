use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meters per degree of latitude used for all degree/meter conversions.
///
/// Approximate; adequate at the coarse pixel sizes this crate works with.
pub const METERS_PER_DEGREE: f64 = 111_325.0;

/// EPSG code of geographic WGS84 coordinates
pub const EPSG_WGS84: u32 = 4326;

/// Single-band raster samples (rows x cols). `NaN` marks no-data.
pub type Band = Array2<f32>;

/// Geospatial bounding box in geographic degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn is_valid(&self) -> bool {
        self.min_lon.is_finite()
            && self.max_lon.is_finite()
            && self.min_lat.is_finite()
            && self.max_lat.is_finite()
            && self.max_lon > self.min_lon
            && self.max_lat > self.min_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon < other.max_lon
            && self.max_lon > other.min_lon
            && self.min_lat < other.max_lat
            && self.max_lat > other.min_lat
    }

    /// Smallest box covering both boxes
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_lon: self.min_lon.min(other.min_lon),
            max_lon: self.max_lon.max(other.max_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// Split into an `n x n` grid of equal cells.
    ///
    /// Cells are returned in row-major order with row 0 at the northern edge,
    /// matching raster row order.
    pub fn partition(&self, n: usize) -> Vec<(usize, usize, BoundingBox)> {
        let n = n.max(1);
        let cell_w = self.width() / n as f64;
        let cell_h = self.height() / n as f64;
        let mut cells = Vec::with_capacity(n * n);

        for row in 0..n {
            let max_lat = self.max_lat - row as f64 * cell_h;
            let min_lat = if row + 1 == n { self.min_lat } else { max_lat - cell_h };
            for col in 0..n {
                let min_lon = self.min_lon + col as f64 * cell_w;
                let max_lon = if col + 1 == n { self.max_lon } else { min_lon + cell_w };
                cells.push((row, col, BoundingBox { min_lon, max_lon, min_lat, max_lat }));
            }
        }

        cells
    }
}

/// Geospatial transformation parameters (GDAL affine layout)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the top-left corner of `bbox`
    pub fn north_up(bbox: &BoundingBox, pixel_size: f64) -> Self {
        Self {
            top_left_x: bbox.min_lon,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// World coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates (col, row) of a world position. Ignores rotation.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Extent covered by a raster of `shape` (rows, cols)
    pub fn bounds(&self, shape: (usize, usize)) -> BoundingBox {
        let (rows, cols) = shape;
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + cols as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + rows as f64 * self.pixel_height;
        BoundingBox {
            min_lon: x0.min(x1),
            max_lon: x0.max(x1),
            min_lat: y0.min(y1),
            max_lat: y0.max(y1),
        }
    }

    /// Transforms match within a tolerance relative to the pixel size
    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        let tol = self.pixel_width.abs().min(self.pixel_height.abs()) * 1e-6;
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol.max(f64::EPSILON))
    }
}

/// Raster band with georeferencing
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub data: Band,
    pub transform: GeoTransform,
    pub epsg: u32,
}

impl GeoRaster {
    pub fn new(data: Band, transform: GeoTransform, epsg: u32) -> Self {
        Self { data, transform, epsg }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn grid(&self) -> GridSpec {
        GridSpec {
            transform: self.transform,
            shape: self.data.dim(),
            epsg: self.epsg,
        }
    }

    /// Number of finite (valid) samples
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }
}

/// Target pixel grid shared by every raster in feature assembly
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub transform: GeoTransform,
    pub shape: (usize, usize),
    pub epsg: u32,
}

impl GridSpec {
    /// Geographic grid covering `bbox` with square pixels of `scale_m` meters
    pub fn for_bbox(bbox: &BoundingBox, scale_m: f64) -> Self {
        let pixel_deg = scale_m / METERS_PER_DEGREE;
        let cols = ((bbox.width() / pixel_deg).round() as usize).max(1);
        let rows = ((bbox.height() / pixel_deg).round() as usize).max(1);
        Self {
            transform: GeoTransform::north_up(bbox, pixel_deg),
            shape: (rows, cols),
            epsg: EPSG_WGS84,
        }
    }

    pub fn is_geographic(&self) -> bool {
        self.epsg == EPSG_WGS84
    }

    pub fn matches(&self, other: &GridSpec) -> bool {
        self.shape == other.shape && self.epsg == other.epsg && self.transform.approx_eq(&other.transform)
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.shape)
    }
}

/// Inclusive start, exclusive end acquisition window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

/// Input sources of the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Multispectral surface reflectance (Sentinel-2 style)
    Optical,
    /// Digital elevation model
    Elevation,
    /// LiDAR-derived reference biomass (GEDI L4A style)
    ReferenceBiomass,
}

impl SourceKind {
    pub fn all() -> [SourceKind; 3] {
        [SourceKind::Optical, SourceKind::Elevation, SourceKind::ReferenceBiomass]
    }

    /// Prefix used for intermediate raster file names
    pub fn file_prefix(&self) -> &'static str {
        match self {
            SourceKind::Optical => "optical",
            SourceKind::Elevation => "elevation",
            SourceKind::ReferenceBiomass => "biomass",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Optical => write!(f, "optical"),
            SourceKind::Elevation => write!(f, "elevation"),
            SourceKind::ReferenceBiomass => write!(f, "reference biomass"),
        }
    }
}

/// Temporally reduced composite: named bands on one grid
#[derive(Debug, Clone)]
pub struct Composite {
    pub source: SourceKind,
    pub bands: BTreeMap<String, GeoRaster>,
}

impl Composite {
    pub fn band(&self, name: &str) -> Option<&GeoRaster> {
        self.bands.get(name)
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }
}

/// Error types for biomass processing
#[derive(Debug, thiserror::Error)]
pub enum BiomassError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Boundary unavailable: {0}")]
    Boundary(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Grid mismatch for {layer}: expected {expected:?}, found {found:?}")]
    GridMismatch {
        layer: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("No tiles could be retrieved for {0}")]
    NoTiles(String),

    #[error("Training set is empty: no pixel has every feature and a reference value")]
    EmptyTrainingSet,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for biomass operations
pub type BiomassResult<T> = Result<T, BiomassError>;
