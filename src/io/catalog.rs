use crate::io::raster::read_named_bands;
use crate::types::{BiomassError, BiomassResult, BoundingBox, DateRange, GeoRaster, GeoTransform};
use chrono::NaiveDate;
use gdal::Dataset;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub id: String,
    /// Acquisition date; unknown for static products such as elevation mosaics
    pub date: Option<NaiveDate>,
    pub extent: BoundingBox,
    pub epsg: u32,
}

/// A searchable collection of scenes
pub trait ImageCatalog {
    /// Scenes intersecting `bbox`, acquired within `period` when one is given.
    ///
    /// Scenes come back in catalog order: ascending date, then id.
    fn query(&self, collection: &str, bbox: &BoundingBox, period: Option<&DateRange>) -> BiomassResult<Vec<Scene>>;

    /// Named bands of a scene returned by [`ImageCatalog::query`]
    fn load(&self, collection: &str, scene: &Scene) -> BiomassResult<BTreeMap<String, GeoRaster>>;
}

/// Sort scenes into catalog order
pub fn sort_scenes(scenes: &mut [Scene]) {
    scenes.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
}

/// Keep scenes intersecting `bbox` and, when a period is given, dated inside it
pub fn filter_scenes(scenes: Vec<Scene>, bbox: &BoundingBox, period: Option<&DateRange>) -> Vec<Scene> {
    scenes
        .into_iter()
        .filter(|scene| scene.extent.intersects(bbox))
        .filter(|scene| match (period, scene.date) {
            (None, _) => true,
            (Some(range), Some(date)) => range.contains(date),
            (Some(_), None) => {
                log::debug!("Scene {} has no acquisition date, skipped for dated query", scene.id);
                false
            }
        })
        .collect()
}

/// Directory of multi-band GeoTIFF scenes.
///
/// A collection is a subdirectory of the root (the root itself for an empty
/// name). Band names come from the GDAL band descriptions; the acquisition
/// date is taken from a `YYYYMMDD` or `YYYY-MM-DD` token in the file name.
#[derive(Debug, Clone)]
pub struct LocalCatalog {
    pub root: PathBuf,
    date_pattern: Regex,
}

impl LocalCatalog {
    pub fn new<P: AsRef<Path>>(root: P) -> BiomassResult<Self> {
        let date_pattern = Regex::new(r"(\d{4})-?(\d{2})-?(\d{2})")
            .map_err(|e| BiomassError::Processing(format!("Invalid date pattern: {}", e)))?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            date_pattern,
        })
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        if collection.is_empty() {
            self.root.clone()
        } else {
            self.root.join(collection)
        }
    }

    fn scene_path(&self, collection: &str, id: &str) -> BiomassResult<PathBuf> {
        let dir = self.collection_dir(collection);
        ["tif", "tiff", "TIF", "TIFF"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", id, ext)))
            .find(|p| p.exists())
            .ok_or_else(|| BiomassError::InvalidFormat(format!("scene {} not found in {}", id, dir.display())))
    }

    /// Acquisition date from the first date-like token of a file name
    pub fn parse_date(&self, name: &str) -> Option<NaiveDate> {
        self.date_pattern.captures_iter(name).find_map(|caps| {
            let year = caps[1].parse().ok()?;
            let month = caps[2].parse().ok()?;
            let day = caps[3].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        })
    }

    fn scan(&self, collection: &str) -> BiomassResult<Vec<Scene>> {
        let dir = self.collection_dir(collection);
        let mut scenes = Vec::new();

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_tiff = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
                .unwrap_or(false);
            if !is_tiff {
                continue;
            }

            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };

            match Self::scene_extent(&path) {
                Ok((extent, epsg)) => scenes.push(Scene {
                    date: self.parse_date(&id),
                    id,
                    extent,
                    epsg,
                }),
                Err(e) => log::warn!("Skipping unreadable scene {}: {}", path.display(), e),
            }
        }

        Ok(scenes)
    }

    fn scene_extent(path: &Path) -> BiomassResult<(BoundingBox, u32)> {
        let dataset = Dataset::open(path)?;
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();
        let epsg = dataset
            .spatial_ref()
            .and_then(|srs| srs.auth_code())
            .ok()
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(crate::types::EPSG_WGS84);
        Ok((transform.bounds((height, width)), epsg))
    }
}

impl ImageCatalog for LocalCatalog {
    fn query(&self, collection: &str, bbox: &BoundingBox, period: Option<&DateRange>) -> BiomassResult<Vec<Scene>> {
        let all = self.scan(collection)?;
        let total = all.len();
        let mut scenes = filter_scenes(all, bbox, period);
        sort_scenes(&mut scenes);

        log::info!(
            "Catalog {}: {} of {} scenes match",
            self.collection_dir(collection).display(),
            scenes.len(),
            total
        );
        Ok(scenes)
    }

    fn load(&self, collection: &str, scene: &Scene) -> BiomassResult<BTreeMap<String, GeoRaster>> {
        let path = self.scene_path(collection, &scene.id)?;
        Ok(read_named_bands(path)?.into_iter().collect())
    }
}
