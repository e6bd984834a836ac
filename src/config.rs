//! Pipeline configuration
//!
//! Every tunable of the workflow lives in [`PipelineConfig`], loaded from a JSON
//! file and validated once before any stage runs.

use crate::types::{BiomassError, BiomassResult, DateRange};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where a source's rasters come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Already exported single-band GeoTIFFs, keyed by band name
    Files { bands: BTreeMap<String, PathBuf> },
    /// Local scene catalog directory; composites are built locally
    Catalog { dir: PathBuf },
    /// Remote tile service; composites are built server-side and fetched in tiles
    Remote {
        endpoint: String,
        image: String,
        bands: Vec<String>,
    },
}

/// Boundary inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Preferred local vector file (shapefile, GeoPackage, GeoJSON)
    pub local_path: Option<PathBuf>,
    /// Remote vector document used when the local file cannot be read
    pub remote_url: Option<String>,
}

/// Quality thresholds applied while building composites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum cloud score for an optical pixel to be kept
    pub cloud_score_threshold: f32,
    /// Maximum `agbd_se / agbd` for a reference pixel to be kept
    pub max_relative_error: f32,
    /// Multiplicative reflectance scale for optical digital numbers
    pub reflectance_scale: f32,
    /// Additional spectral indices beyond ndvi, mndwi, ndbi and evi.
    ///
    /// Empty by default. Listing savi, bsi, gci, arvi, ndmi and cire gives the
    /// full ten-index feature set.
    pub extra_indices: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            cloud_score_threshold: 0.5,
            max_relative_error: 0.3,
            reflectance_scale: 0.0001,
            extra_indices: Vec::new(),
        }
    }
}

/// Tiled retrieval settings for remote sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Grid partition factor N (N x N tiles)
    pub grid_size: usize,
    /// Pause between consecutive tile requests, milliseconds
    pub pause_ms: u64,
    /// Per-request timeout, seconds
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            grid_size: 4,
            pause_ms: 1000,
            timeout_secs: 300,
        }
    }
}

/// Regression and sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub sample_cap: usize,
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    /// Fraction of features considered per split, (0, 1]
    pub max_features: f64,
    pub seed: u64,
    /// Fraction of the sample held out for validation RMSE; 0 disables
    pub holdout_fraction: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sample_cap: 100_000,
            n_trees: 100,
            max_depth: None,
            min_samples_leaf: 1,
            max_features: 1.0,
            seed: 42,
            holdout_fraction: 0.0,
        }
    }
}

/// Block prediction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub block_size: usize,
    /// Pixels steeper than this (degrees) are never predicted
    pub slope_threshold: f32,
    /// Drop reference pixels at or above this slope before training
    pub reference_slope_limit: Option<f32>,
    /// Optional land-cover class raster restricting the biomass total
    pub land_cover_path: Option<PathBuf>,
    /// Land-cover classes counted in the total
    pub land_cover_classes: Vec<u16>,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            block_size: 1000,
            slope_threshold: 30.0,
            reference_slope_limit: None,
            land_cover_path: None,
            land_cover_classes: vec![10, 20, 30, 40, 95],
        }
    }
}

/// Complete workflow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub boundary: BoundaryConfig,
    pub period: DateRange,
    /// Target pixel size in meters
    pub scale_m: f64,
    pub optical: SourceSpec,
    pub elevation: SourceSpec,
    pub reference: SourceSpec,
    /// Directory for intermediate rasters
    pub work_dir: PathBuf,
    /// Directory for final products
    pub output_dir: PathBuf,
    /// Resample misaligned rasters onto the target grid instead of failing
    #[serde(default = "default_true")]
    pub resample_to_grid: bool,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let work_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("biomap");

        Self {
            boundary: BoundaryConfig {
                local_path: Some(PathBuf::from("data/vector/boundary.shp")),
                remote_url: None,
            },
            period: DateRange {
                start: NaiveDate::from_ymd_opt(2022, 10, 10).unwrap_or_default(),
                end: NaiveDate::from_ymd_opt(2023, 10, 10).unwrap_or_default(),
            },
            scale_m: 100.0,
            optical: SourceSpec::Catalog { dir: PathBuf::from("data/sentinel") },
            elevation: SourceSpec::Catalog { dir: PathBuf::from("data/dem") },
            reference: SourceSpec::Catalog { dir: PathBuf::from("data/gedi") },
            work_dir,
            output_dir: PathBuf::from("results"),
            resample_to_grid: true,
            quality: QualityConfig::default(),
            retrieval: RetrievalConfig::default(),
            model: ModelConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BiomassResult<Self> {
        log::info!("Loading configuration from: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn write<P: AsRef<Path>>(&self, path: P) -> BiomassResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn source(&self, kind: crate::types::SourceKind) -> &SourceSpec {
        match kind {
            crate::types::SourceKind::Optical => &self.optical,
            crate::types::SourceKind::Elevation => &self.elevation,
            crate::types::SourceKind::ReferenceBiomass => &self.reference,
        }
    }

    /// Check every value once, before the pipeline starts
    pub fn validate(&self) -> BiomassResult<()> {
        fn fail<T>(msg: String) -> BiomassResult<T> {
            Err(BiomassError::Config(msg))
        }

        if self.boundary.local_path.is_none() && self.boundary.remote_url.is_none() {
            return fail("boundary needs a local_path or a remote_url".to_string());
        }
        if self.period.end <= self.period.start {
            return fail(format!(
                "period end {} must be after start {}",
                self.period.end, self.period.start
            ));
        }
        if !(self.scale_m.is_finite() && self.scale_m > 0.0) {
            return fail(format!("scale_m must be positive, got {}", self.scale_m));
        }
        if self.retrieval.grid_size == 0 {
            return fail("retrieval.grid_size must be at least 1".to_string());
        }
        if self.model.sample_cap == 0 {
            return fail("model.sample_cap must be at least 1".to_string());
        }
        if self.model.n_trees == 0 {
            return fail("model.n_trees must be at least 1".to_string());
        }
        if self.model.min_samples_leaf == 0 {
            return fail("model.min_samples_leaf must be at least 1".to_string());
        }
        if !(self.model.max_features > 0.0 && self.model.max_features <= 1.0) {
            return fail(format!(
                "model.max_features must be in (0, 1], got {}",
                self.model.max_features
            ));
        }
        if !(0.0..0.9).contains(&self.model.holdout_fraction) {
            return fail(format!(
                "model.holdout_fraction must be in [0, 0.9), got {}",
                self.model.holdout_fraction
            ));
        }
        if self.prediction.block_size == 0 {
            return fail("prediction.block_size must be at least 1".to_string());
        }
        if !self.prediction.slope_threshold.is_finite() {
            return fail("prediction.slope_threshold must be finite".to_string());
        }
        if !(self.quality.reflectance_scale.is_finite() && self.quality.reflectance_scale > 0.0) {
            return fail("quality.reflectance_scale must be positive".to_string());
        }
        for name in &self.quality.extra_indices {
            if crate::core::indices::SpectralIndex::from_name(name).is_none() {
                return fail(format!("unknown spectral index '{}'", name));
            }
        }

        for kind in crate::types::SourceKind::all() {
            match self.source(kind) {
                SourceSpec::Files { bands } if bands.is_empty() => {
                    return fail(format!("{} source lists no band files", kind));
                }
                SourceSpec::Remote { bands, endpoint, .. } => {
                    if bands.is_empty() {
                        return fail(format!("{} source lists no remote bands", kind));
                    }
                    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                        return fail(format!("{} endpoint is not an http(s) URL: {}", kind, endpoint));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}
