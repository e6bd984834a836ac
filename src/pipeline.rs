//! End-to-end biomass workflow
//!
//! Boundary → composites (local catalog, exported files or tiled remote
//! retrieval) → slope → feature stack → random forest → block prediction →
//! result files.

use crate::config::{PipelineConfig, SourceSpec};
use crate::core::composite::{is_reflectance_band, write_composite, CompositeBuilder, DEM_BAND};
use crate::core::features::{AlignmentPolicy, FeatureAssembler, FeatureStack, SLOPE_BAND};
use crate::core::forest::{ForestParams, RandomForestRegressor};
use crate::core::indices::{compute_index, SpectralIndex};
use crate::core::prediction::{BlockPredictor, ExclusionRule, PredictionStats};
use crate::core::quality::AGBD_BAND;
use crate::core::resample::resample_nearest;
use crate::core::terrain::TerrainAnalyzer;
use crate::core::tiling::{RetrievalReport, TileSource, TiledRetriever};
use crate::core::training::{ModelTrainer, TrainingReport};
use crate::io::boundary::{Boundary, BoundaryOrigin, BoundaryResolver};
use crate::io::catalog::LocalCatalog;
use crate::io::raster::{read_geotiff, write_geotiff};
use crate::io::remote::HttpTileSource;
use crate::io::results::{total_biomass, LandCoverMask, ResultWriter, SummaryMetrics, WrittenOutputs};
use crate::types::{BiomassError, BiomassResult, Composite, GeoRaster, GridSpec, SourceKind};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// What a completed run produced
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub boundary_origin: BoundaryOrigin,
    pub grid: GridSpec,
    pub feature_names: Vec<String>,
    pub training: TrainingReport,
    pub prediction: PredictionStats,
    pub total_biomass_mg: f64,
    pub outputs: WrittenOutputs,
    /// Tiled retrieval reports of remote sources, keyed by `<source>_<band>`
    pub retrievals: BTreeMap<String, RetrievalReport>,
}

/// Creates the tile source of one band of a remote image
pub trait TileSourceFactory: Send + Sync {
    fn create(&self, endpoint: &str, image: &str, band: &str) -> BiomassResult<Box<dyn TileSource>>;
}

impl<F> TileSourceFactory for F
where
    F: Fn(&str, &str, &str) -> BiomassResult<Box<dyn TileSource>> + Send + Sync,
{
    fn create(&self, endpoint: &str, image: &str, band: &str) -> BiomassResult<Box<dyn TileSource>> {
        self(endpoint, image, band)
    }
}

/// HTTP tile service with a per-request timeout
#[derive(Debug, Clone, Copy)]
pub struct HttpTileSourceFactory {
    pub timeout: Duration,
}

impl TileSourceFactory for HttpTileSourceFactory {
    fn create(&self, endpoint: &str, image: &str, band: &str) -> BiomassResult<Box<dyn TileSource>> {
        Ok(Box::new(HttpTileSource::new(endpoint, image, band, self.timeout)?))
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    tile_sources: Box<dyn TileSourceFactory>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> BiomassResult<Self> {
        config.validate()?;
        let tile_sources = Box::new(HttpTileSourceFactory {
            timeout: Duration::from_secs(config.retrieval.timeout_secs),
        });
        Ok(Self { config, tile_sources })
    }

    /// Serve remote sources from `factory` instead of HTTP
    pub fn with_tile_sources<F: TileSourceFactory + 'static>(mut self, factory: F) -> Self {
        self.tile_sources = Box::new(factory);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self) -> BiomassResult<PipelineSummary> {
        let start = Instant::now();
        let config = &self.config;
        std::fs::create_dir_all(&config.work_dir)?;

        log::info!("Step 1/6: resolving boundary");
        let boundary = BoundaryResolver::from_config(&config.boundary).resolve()?;
        let grid = GridSpec::for_bbox(boundary.bbox(), config.scale_m);
        log::info!("Target grid {:?} at {} m over {:?}", grid.shape, config.scale_m, boundary.bbox());

        log::info!("Step 2/6: building composites");
        let mut retrievals = BTreeMap::new();
        let mut composites = BTreeMap::new();
        for kind in SourceKind::all() {
            let composite = self.load_source(kind, &boundary, &grid, &mut retrievals)?;
            composites.insert(kind, composite);
        }

        log::info!("Step 3/6: assembling features");
        let stack = self.assemble(&composites, &boundary, &grid)?;

        log::info!("Step 4/6: training model");
        let forest = RandomForestRegressor::new(ForestParams::from(&config.model));
        let mut trainer = ModelTrainer::new(forest, config.model.sample_cap, config.model.seed);
        trainer.holdout_fraction = config.model.holdout_fraction;
        let trained = trainer.train(&stack)?;

        log::info!("Step 5/6: predicting biomass");
        let predictor = BlockPredictor::new(
            config.prediction.block_size,
            Some(ExclusionRule::slope_above(config.prediction.slope_threshold)),
        );
        let (prediction, stats) = predictor.predict(&trained.model, &stack)?;

        log::info!("Step 6/6: writing results");
        let total = self.total_biomass(&prediction)?;
        let metrics = SummaryMetrics::new(&trained.report, &stats, total);
        let outputs = ResultWriter::new(&config.output_dir).write_all(&prediction, &metrics, &trained.report.pairs)?;

        log::info!("Pipeline finished in {:.1} s", start.elapsed().as_secs_f64());

        Ok(PipelineSummary {
            boundary_origin: boundary.origin().clone(),
            grid,
            feature_names: stack.names.clone(),
            training: trained.report,
            prediction: stats,
            total_biomass_mg: total,
            outputs,
            retrievals,
        })
    }

    fn load_source(
        &self,
        kind: SourceKind,
        boundary: &Boundary,
        grid: &GridSpec,
        retrievals: &mut BTreeMap<String, RetrievalReport>,
    ) -> BiomassResult<Composite> {
        let config = &self.config;

        match config.source(kind) {
            SourceSpec::Catalog { dir } => {
                let catalog = LocalCatalog::new(dir)?;
                let builder = CompositeBuilder::new(*grid, config.quality.clone());
                let composite = builder.build(&catalog, "", kind, &config.period, boundary)?;
                write_composite(&composite, &config.work_dir)?;
                Ok(composite)
            }
            SourceSpec::Files { bands } => {
                let mut composite = Composite {
                    source: kind,
                    bands: BTreeMap::new(),
                };
                for (name, path) in bands {
                    log::info!("Loading {} band {} from {}", kind, name, path.display());
                    composite.bands.insert(name.clone(), read_geotiff(path, 1)?);
                }
                if kind == SourceKind::Optical {
                    self.derive_missing_indices(&mut composite)?;
                }
                Ok(composite)
            }
            SourceSpec::Remote { endpoint, image, bands } => {
                let retriever = TiledRetriever::new(
                    config.retrieval.grid_size,
                    Duration::from_millis(config.retrieval.pause_ms),
                );
                let mut composite = Composite {
                    source: kind,
                    bands: BTreeMap::new(),
                };
                for band in bands {
                    log::info!("Retrieving {} band {} of {}", kind, band, image);
                    let source = self.tile_sources.create(endpoint, image, band)?;
                    let retrieved = retriever.retrieve(source.as_ref(), boundary.bbox(), config.scale_m)?;

                    let key = format!("{}_{}", kind.file_prefix(), band);
                    write_geotiff(&retrieved.raster, config.work_dir.join(format!("{}.tif", key)), None)?;
                    if !retrieved.report.is_complete() {
                        log::warn!(
                            "{}: {} tiles missing, rows {:?} dropped",
                            key,
                            retrieved.report.missing(),
                            retrieved.report.dropped_rows
                        );
                    }
                    retrievals.insert(key, retrieved.report);
                    composite.bands.insert(band.clone(), retrieved.raster);
                }
                if kind == SourceKind::Optical {
                    self.derive_missing_indices(&mut composite)?;
                }
                Ok(composite)
            }
        }
    }

    /// Exported or served reflectance may come without index layers; derive what is absent
    fn derive_missing_indices(&self, composite: &mut Composite) -> BiomassResult<()> {
        let Some(reference) = composite.bands.values().next().cloned() else {
            return Ok(());
        };
        if composite.bands.values().any(|b| !b.grid().matches(&reference.grid())) {
            log::debug!("Optical files are on different grids; indices not derived");
            return Ok(());
        }

        let mut wanted = SpectralIndex::STANDARD.to_vec();
        wanted.extend(
            self.config
                .quality
                .extra_indices
                .iter()
                .filter_map(|n| SpectralIndex::from_name(n)),
        );

        let arrays: BTreeMap<String, _> = composite
            .bands
            .iter()
            .map(|(name, raster)| (name.clone(), raster.data.clone()))
            .collect();
        for index in wanted {
            if composite.bands.contains_key(index.name()) {
                continue;
            }
            if index.required_bands().iter().all(|b| arrays.contains_key(*b)) {
                let data = compute_index(index, &arrays)?;
                log::info!("Derived {} from optical files", index);
                composite
                    .bands
                    .insert(index.name().to_string(), GeoRaster::new(data, reference.transform, reference.epsg));
            }
        }
        Ok(())
    }

    fn assemble(
        &self,
        composites: &BTreeMap<SourceKind, Composite>,
        boundary: &Boundary,
        grid: &GridSpec,
    ) -> BiomassResult<FeatureStack> {
        let missing = |kind: SourceKind| BiomassError::Processing(format!("{} composite missing", kind));
        let optical = composites.get(&SourceKind::Optical).ok_or_else(|| missing(SourceKind::Optical))?;
        let elevation = composites.get(&SourceKind::Elevation).ok_or_else(|| missing(SourceKind::Elevation))?;
        let reference = composites
            .get(&SourceKind::ReferenceBiomass)
            .ok_or_else(|| missing(SourceKind::ReferenceBiomass))?;

        let mut layers: Vec<(String, GeoRaster)> = optical
            .bands
            .iter()
            .filter(|(name, _)| is_reflectance_band(name) || SpectralIndex::from_name(name).is_some())
            .map(|(name, raster)| (name.clone(), raster.clone()))
            .collect();

        let dem = single_band(elevation, &[DEM_BAND, "DEM", "elevation"])?;
        let slope = match elevation.band(SLOPE_BAND) {
            Some(slope) => slope.clone(),
            None => TerrainAnalyzer::slope_degrees(dem)?,
        };
        layers.push((DEM_BAND.to_string(), dem.clone()));
        layers.push((SLOPE_BAND.to_string(), slope));

        let target = single_band(reference, &[AGBD_BAND])?.clone();

        let assembler = FeatureAssembler {
            grid: *grid,
            policy: if self.config.resample_to_grid {
                AlignmentPolicy::Resample
            } else {
                AlignmentPolicy::Strict
            },
            reference_slope_limit: self.config.prediction.reference_slope_limit,
        };
        assembler.assemble(layers, Some(target), Some(boundary))
    }

    fn total_biomass(&self, prediction: &GeoRaster) -> BiomassResult<f64> {
        let Some(path) = &self.config.prediction.land_cover_path else {
            return total_biomass(prediction, None);
        };

        log::info!("Restricting biomass total to land-cover classes {:?}", self.config.prediction.land_cover_classes);
        let land_cover = read_geotiff(path, 1)?;
        let classes = if land_cover.grid().matches(&prediction.grid()) {
            land_cover
        } else {
            resample_nearest(&land_cover, &prediction.grid())
        };
        let mask = LandCoverMask {
            classes: &classes.data,
            keep: &self.config.prediction.land_cover_classes,
        };
        total_biomass(prediction, Some(&mask))
    }
}

/// The band matching one of `names`, or the only band
fn single_band<'a>(composite: &'a Composite, names: &[&str]) -> BiomassResult<&'a GeoRaster> {
    names
        .iter()
        .find_map(|n| composite.band(n))
        .or_else(|| {
            let non_slope: Vec<&GeoRaster> = composite
                .bands
                .iter()
                .filter(|(n, _)| n.as_str() != SLOPE_BAND)
                .map(|(_, r)| r)
                .collect();
            (non_slope.len() == 1).then(|| non_slope[0])
        })
        .ok_or_else(|| {
            BiomassError::InvalidFormat(format!(
                "{} composite has no {} band (bands: {:?})",
                composite.source,
                names[0],
                composite.band_names()
            ))
        })
}
