use crate::config::BoundaryConfig;
use crate::types::{BiomassError, BiomassResult, BoundingBox, GeoRaster, GridSpec, EPSG_WGS84};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{BoundingRect, Contains, Geometry, MultiPolygon, Point, Polygon, Rect};
use ndarray::{Array2, Zip};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where a boundary was resolved from
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryOrigin {
    Local(PathBuf),
    Remote(String),
}

/// Study-area polygons in geographic coordinates (lon/lat, EPSG:4326)
#[derive(Debug, Clone)]
pub struct Boundary {
    area: MultiPolygon<f64>,
    /// Extent of each polygon, checked before the exact containment test
    extents: Vec<Rect<f64>>,
    bbox: BoundingBox,
    origin: BoundaryOrigin,
}

impl Boundary {
    pub fn new(area: MultiPolygon<f64>, origin: BoundaryOrigin) -> BiomassResult<Self> {
        let rect = area
            .bounding_rect()
            .ok_or_else(|| BiomassError::Boundary("boundary has no polygons".to_string()))?;
        let bbox = BoundingBox::new(rect.min().x, rect.max().x, rect.min().y, rect.max().y);
        if !bbox.is_valid() {
            return Err(BiomassError::Boundary(format!("degenerate boundary extent {:?}", bbox)));
        }
        if bbox.min_lon < -180.0 || bbox.max_lon > 180.0 || bbox.min_lat < -90.0 || bbox.max_lat > 90.0 {
            return Err(BiomassError::Boundary(format!(
                "boundary extent {:?} is not in geographic degrees",
                bbox
            )));
        }

        let extents = area.0.iter().filter_map(|p| p.bounding_rect()).collect();
        Ok(Self {
            area,
            extents,
            bbox,
            origin,
        })
    }

    pub fn from_polygon(polygon: Polygon<f64>, origin: BoundaryOrigin) -> BiomassResult<Self> {
        Self::new(MultiPolygon(vec![polygon]), origin)
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn origin(&self) -> &BoundaryOrigin {
        &self.origin
    }

    pub fn area(&self) -> &MultiPolygon<f64> {
        &self.area
    }

    pub fn polygon_count(&self) -> usize {
        self.area.0.len()
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let point = Point::new(lon, lat);
        self.area.0.iter().zip(&self.extents).any(|(polygon, extent)| {
            let (min, max) = (extent.min(), extent.max());
            lon >= min.x && lon <= max.x && lat >= min.y && lat <= max.y && polygon.contains(&point)
        })
    }

    /// Pixels of `grid` whose centre lies inside the boundary
    pub fn mask(&self, grid: &GridSpec) -> Array2<bool> {
        let mut mask = Array2::from_elem(grid.shape, false);
        let transform = grid.transform;
        let inside = |(i, j): (usize, usize), m: &mut bool| {
            let (lon, lat) = transform.pixel_center(i, j);
            *m = self.contains(lon, lat);
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut mask).par_for_each(inside);

        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut mask).for_each(inside);

        mask
    }

    /// Set pixels outside the boundary to NaN; returns how many were cleared
    pub fn clip(&self, raster: &mut GeoRaster) -> usize {
        let grid = raster.grid();
        if !grid.is_geographic() {
            log::warn!("Skipping boundary clip for non-geographic grid (EPSG:{})", grid.epsg);
            return 0;
        }

        let mask = self.mask(&grid);
        let mut cleared = 0;
        Zip::from(&mut raster.data).and(&mask).for_each(|v, &inside| {
            if !inside && !v.is_nan() {
                *v = f32::NAN;
                cleared += 1;
            }
        });
        cleared
    }
}

/// A place a boundary can be loaded from
pub trait BoundarySource {
    fn load(&self) -> BiomassResult<Boundary>;

    fn describe(&self) -> String;
}

/// Any OGR-readable vector file (shapefile, GeoPackage, GeoJSON)
#[derive(Debug, Clone)]
pub struct LocalVectorSource {
    pub path: PathBuf,
}

impl BoundarySource for LocalVectorSource {
    fn load(&self) -> BiomassResult<Boundary> {
        let area = read_vector_polygons(&self.path)?;
        Boundary::new(area, BoundaryOrigin::Local(self.path.clone()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Vector document served over HTTP, parsed with the same OGR reader
#[derive(Debug, Clone)]
pub struct RemoteVectorSource {
    pub url: String,
    pub timeout_secs: u64,
}

impl RemoteVectorSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: 300,
        }
    }
}

impl BoundarySource for RemoteVectorSource {
    fn load(&self) -> BiomassResult<Boundary> {
        log::info!("Downloading boundary from: {}", self.url);

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .user_agent(concat!("biomap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let response = client.get(&self.url).send()?.error_for_status()?;
        let content = response.bytes()?;
        log::debug!("Downloaded {} bytes", content.len());

        // Zipped shapefiles are read through GDAL's zip filesystem
        let zipped = crate::io::remote::is_zip_content(&content);
        let suffix = if zipped {
            ".zip".to_string()
        } else {
            url_suffix(&self.url).unwrap_or_else(|| ".geojson".to_string())
        };

        let mut file = tempfile::Builder::new().prefix("boundary").suffix(&suffix).tempfile()?;
        file.write_all(&content)?;
        file.flush()?;

        let path = if zipped {
            PathBuf::from(format!("/vsizip/{}", file.path().display()))
        } else {
            file.path().to_path_buf()
        };

        let area = read_vector_polygons(&path)?;
        Boundary::new(area, BoundaryOrigin::Remote(self.url.clone()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn url_suffix(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(format!(".{}", ext))
}

/// Polygons of every feature in the first layer, in lon/lat.
///
/// Layers in any other reference system are transformed to WGS84; layers
/// without one are taken as lon/lat.
fn read_vector_polygons(path: &Path) -> BiomassResult<MultiPolygon<f64>> {
    log::debug!("Reading vector boundary: {}", path.display());
    let dataset = Dataset::open(path)?;
    let mut layer = dataset.layer(0)?;

    let to_wgs84 = match layer.spatial_ref() {
        Some(srs) if srs.auth_code().ok() != Some(EPSG_WGS84 as i32) => {
            match srs.auth_code() {
                Ok(code) => log::info!("Transforming boundary from EPSG:{} to EPSG:{}", code, EPSG_WGS84),
                Err(_) => log::info!("Transforming boundary to EPSG:{}", EPSG_WGS84),
            }
            // PROJ.4 definitions keep lon/lat axis order
            let wgs84 = SpatialRef::from_proj4("+proj=longlat +datum=WGS84 +no_defs")?;
            Some(CoordTransform::new(&srs, &wgs84)?)
        }
        Some(_) => None,
        None => {
            log::warn!("Boundary layer has no spatial reference; assuming lon/lat");
            None
        }
    };

    let mut polygons = Vec::new();
    let mut feature_count = 0;
    for feature in layer.features() {
        feature_count += 1;
        let Ok(geometry) = feature.geometry_by_index(0) else {
            continue;
        };
        let geometry = match &to_wgs84 {
            Some(transform) => geometry.transform(transform)?.to_geo()?,
            None => geometry.to_geo()?,
        };
        collect_polygons(geometry, &mut polygons);
    }

    log::debug!("Boundary: {} features, {} polygons", feature_count, polygons.len());
    Ok(MultiPolygon(polygons))
}

fn collect_polygons(geometry: Geometry<f64>, polygons: &mut Vec<Polygon<f64>>) {
    match geometry {
        Geometry::Polygon(polygon) => polygons.push(polygon),
        Geometry::MultiPolygon(multi) => polygons.extend(multi.0),
        Geometry::GeometryCollection(collection) => {
            for part in collection.0 {
                collect_polygons(part, polygons);
            }
        }
        other => log::debug!("Ignoring non-polygon boundary geometry {:?}", other),
    }
}

/// Local file first, remote document as fallback
pub struct BoundaryResolver {
    local: Option<Box<dyn BoundarySource>>,
    remote: Option<Box<dyn BoundarySource>>,
}

impl BoundaryResolver {
    pub fn new(local: Option<Box<dyn BoundarySource>>, remote: Option<Box<dyn BoundarySource>>) -> Self {
        Self { local, remote }
    }

    pub fn from_config(config: &BoundaryConfig) -> Self {
        let local = config
            .local_path
            .as_ref()
            .map(|p| Box::new(LocalVectorSource { path: p.clone() }) as Box<dyn BoundarySource>);
        let remote = config
            .remote_url
            .as_ref()
            .map(|u| Box::new(RemoteVectorSource::new(u.clone())) as Box<dyn BoundarySource>);
        Self { local, remote }
    }

    pub fn resolve(&self) -> BiomassResult<Boundary> {
        let local_error = match &self.local {
            Some(source) => match source.load() {
                Ok(boundary) => {
                    log::info!("Boundary loaded from {}", source.describe());
                    return Ok(boundary);
                }
                Err(e) => {
                    log::warn!("Local boundary {} unavailable: {}", source.describe(), e);
                    format!("local {}: {}", source.describe(), e)
                }
            },
            None => "no local boundary configured".to_string(),
        };

        let Some(remote) = &self.remote else {
            return Err(BiomassError::Boundary(local_error));
        };

        match remote.load() {
            Ok(boundary) => {
                log::info!("Boundary loaded from remote fallback {}", remote.describe());
                Ok(boundary)
            }
            Err(e) => Err(BiomassError::Boundary(format!(
                "{}; remote {}: {}",
                local_error,
                remote.describe(),
                e
            ))),
        }
    }
}
