//! Composite building: per-scene masking and scaling, temporal reduction,
//! boundary clipping.

use crate::config::QualityConfig;
use crate::core::indices::{add_indices, scale_reflectance, SpectralIndex};
use crate::core::quality::{
    QualityMask, AGBD_BAND, AGBD_SE_BAND, CLOUD_SCORE_BAND, DEGRADE_FLAG_BAND, L4_QUALITY_FLAG_BAND,
};
use crate::core::resample::resample_bilinear;
use crate::io::boundary::Boundary;
use crate::io::catalog::{ImageCatalog, Scene};
use crate::io::raster::{write_geotiff, GeoTiffOptions};
use crate::types::{Band, BiomassError, BiomassResult, Composite, DateRange, GeoRaster, GridSpec, SourceKind};
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Elevation band name after normalisation
pub const DEM_BAND: &str = "dem";

/// Temporal reduction of a scene stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Per-pixel median of the valid values
    Median,
    /// First valid value in catalog order (mosaic)
    FirstValid,
}

impl Reducer {
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Optical => Reducer::Median,
            SourceKind::Elevation | SourceKind::ReferenceBiomass => Reducer::FirstValid,
        }
    }

    /// Reduce co-registered layers to one
    pub fn reduce(&self, layers: &[Band]) -> BiomassResult<Band> {
        let first = layers
            .first()
            .ok_or_else(|| BiomassError::Processing("nothing to reduce".to_string()))?;
        let shape = first.dim();
        if layers.iter().any(|l| l.dim() != shape) {
            return Err(BiomassError::Processing("layers to reduce differ in shape".to_string()));
        }

        let mut out = Array2::from_elem(shape, f32::NAN);

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(row, line)| self.reduce_row(layers, row, line));
        }

        #[cfg(not(feature = "parallel"))]
        {
            for (row, line) in out.axis_iter_mut(Axis(0)).enumerate() {
                self.reduce_row(layers, row, line);
            }
        }

        Ok(out)
    }

    fn reduce_row(&self, layers: &[Band], row: usize, mut line: ndarray::ArrayViewMut1<f32>) {
        let mut values = Vec::with_capacity(layers.len());
        for (col, cell) in line.iter_mut().enumerate() {
            *cell = match self {
                Reducer::FirstValid => layers
                    .iter()
                    .map(|l| l[[row, col]])
                    .find(|v| !v.is_nan())
                    .unwrap_or(f32::NAN),
                Reducer::Median => {
                    values.clear();
                    values.extend(layers.iter().map(|l| l[[row, col]]).filter(|v| !v.is_nan()));
                    median(&mut values)
                }
            };
        }
    }
}

/// Median of the values; the mean of the two middle values for an even count
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Builds one composite per source on a shared target grid
#[derive(Debug, Clone)]
pub struct CompositeBuilder {
    pub grid: GridSpec,
    pub quality: QualityConfig,
}

impl CompositeBuilder {
    pub fn new(grid: GridSpec, quality: QualityConfig) -> Self {
        Self { grid, quality }
    }

    /// Query, mask, reduce and clip one source
    pub fn build<C: ImageCatalog + ?Sized>(
        &self,
        catalog: &C,
        collection: &str,
        kind: SourceKind,
        period: &DateRange,
        boundary: &Boundary,
    ) -> BiomassResult<Composite> {
        log::info!("Building {} composite", kind);

        // Elevation is a static product
        let period = match kind {
            SourceKind::Elevation => None,
            _ => Some(period),
        };
        let scenes = catalog.query(collection, boundary.bbox(), period)?;
        if scenes.is_empty() {
            return Err(BiomassError::Processing(format!("no {} scenes match the query", kind)));
        }

        let mut stacks: BTreeMap<String, Vec<Band>> = BTreeMap::new();
        for scene in &scenes {
            let bands = match self.prepare_scene(catalog, collection, kind, scene) {
                Ok(bands) => bands,
                Err(e) => {
                    log::warn!("Skipping {} scene {}: {}", kind, scene.id, e);
                    continue;
                }
            };
            for (name, band) in bands {
                stacks.entry(name).or_default().push(band);
            }
        }

        if stacks.is_empty() {
            return Err(BiomassError::Processing(format!("no usable {} scenes", kind)));
        }

        let reducer = Reducer::for_source(kind);
        let mut composite = Composite {
            source: kind,
            bands: BTreeMap::new(),
        };
        for (name, layers) in stacks {
            let data = reducer.reduce(&layers)?;
            let mut raster = GeoRaster::new(data, self.grid.transform, self.grid.epsg);
            boundary.clip(&mut raster);
            log::debug!("{} band {}: {} valid pixels", kind, name, raster.valid_count());
            composite.bands.insert(name, raster);
        }

        log::info!(
            "{} composite from {} scenes: {:?}",
            kind,
            scenes.len(),
            composite.band_names()
        );
        Ok(composite)
    }

    fn prepare_scene<C: ImageCatalog + ?Sized>(
        &self,
        catalog: &C,
        collection: &str,
        kind: SourceKind,
        scene: &Scene,
    ) -> BiomassResult<BTreeMap<String, Band>> {
        let mut bands: BTreeMap<String, Band> = catalog
            .load(collection, scene)?
            .into_iter()
            .map(|(name, raster)| (name, self.to_grid(&raster)))
            .collect();

        match kind {
            SourceKind::Optical => self.prepare_optical(&mut bands, &scene.id)?,
            SourceKind::ReferenceBiomass => self.prepare_reference(&mut bands)?,
            SourceKind::Elevation => Self::prepare_elevation(&mut bands)?,
        }
        Ok(bands)
    }

    fn to_grid(&self, raster: &GeoRaster) -> Band {
        if raster.grid().matches(&self.grid) {
            raster.data.clone()
        } else {
            resample_bilinear(raster, &self.grid).data
        }
    }

    /// Cloud mask, keep `B*` bands, scale reflectance, derive indices
    fn prepare_optical(&self, bands: &mut BTreeMap<String, Band>, scene_id: &str) -> BiomassResult<()> {
        match bands.get(CLOUD_SCORE_BAND) {
            Some(cs) => {
                let mask = QualityMask::cloud_score(cs, self.quality.cloud_score_threshold);
                QualityMask::apply(bands, &mask)?;
            }
            None => log::warn!("Scene {} has no {} band; used unmasked", scene_id, CLOUD_SCORE_BAND),
        }

        bands.retain(|name, _| is_reflectance_band(name));
        for band in bands.values_mut() {
            scale_reflectance(band, self.quality.reflectance_scale);
        }

        let extra: Vec<SpectralIndex> = self
            .quality
            .extra_indices
            .iter()
            .filter_map(|name| SpectralIndex::from_name(name))
            .collect();
        add_indices(bands, &extra)
    }

    /// Quality flags and relative error; only `agbd` survives
    fn prepare_reference(&self, bands: &mut BTreeMap<String, Band>) -> BiomassResult<()> {
        let get = |name: &str| {
            bands
                .get(name)
                .ok_or_else(|| BiomassError::InvalidFormat(format!("reference scene lacks band {}", name)))
        };
        let mask = QualityMask::reference_quality(
            get(L4_QUALITY_FLAG_BAND)?,
            get(DEGRADE_FLAG_BAND)?,
            get(AGBD_BAND)?,
            get(AGBD_SE_BAND)?,
            self.quality.max_relative_error,
        )?;

        bands.retain(|name, _| name == AGBD_BAND);
        QualityMask::apply(bands, &mask)?;
        Ok(())
    }

    /// Normalise the elevation band name to `dem`
    fn prepare_elevation(bands: &mut BTreeMap<String, Band>) -> BiomassResult<()> {
        let key = if bands.len() == 1 {
            bands.keys().next().cloned()
        } else {
            bands
                .keys()
                .find(|k| k.eq_ignore_ascii_case(DEM_BAND) || k.eq_ignore_ascii_case("elevation"))
                .cloned()
        };

        let data = key
            .and_then(|k| bands.remove(&k))
            .ok_or_else(|| BiomassError::InvalidFormat("elevation scene has no DEM band".to_string()))?;
        bands.clear();
        bands.insert(DEM_BAND.to_string(), data);
        Ok(())
    }
}

/// Sentinel-2 style reflectance band names: `B` followed by a band number
pub fn is_reflectance_band(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('B') && {
        let rest = chars.as_str();
        !rest.is_empty() && rest.chars().next().map_or(false, |c| c.is_ascii_digit())
    }
}

/// Write every band of a composite as `<source>_<band>.tif`
pub fn write_composite<P: AsRef<Path>>(composite: &Composite, dir: P) -> BiomassResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir.as_ref())?;
    let options = GeoTiffOptions::default();

    composite
        .bands
        .iter()
        .map(|(name, raster)| {
            let path = dir
                .as_ref()
                .join(format!("{}_{}.tif", composite.source.file_prefix(), name));
            write_geotiff(raster, &path, Some(&options))?;
            Ok(path)
        })
        .collect()
}
