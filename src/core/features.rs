use crate::core::composite::DEM_BAND;
use crate::core::indices::SpectralIndex;
use crate::core::quality::QualityMask;
use crate::core::resample::resample_bilinear;
use crate::io::boundary::Boundary;
use crate::types::{Band, BiomassError, BiomassResult, GeoRaster, GridSpec};

/// Slope layer name
pub const SLOPE_BAND: &str = "slope";

/// Reflectance bands that lead the feature order
const LEADING_BANDS: [&str; 5] = ["B2", "B3", "B4", "B8", "B11"];

/// What to do with a layer whose grid differs from the target grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentPolicy {
    /// Bilinear resampling onto the target grid
    #[default]
    Resample,
    /// Fail with [`BiomassError::GridMismatch`]
    Strict,
}

/// Co-registered feature layers plus an optional reference target
#[derive(Debug, Clone)]
pub struct FeatureStack {
    pub grid: GridSpec,
    pub names: Vec<String>,
    pub layers: Vec<Band>,
    pub target: Option<Band>,
}

impl FeatureStack {
    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape
    }

    pub fn n_features(&self) -> usize {
        self.layers.len()
    }

    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// All feature values at a pixel, or `None` when any is missing
    pub fn feature_vector(&self, row: usize, col: usize) -> Option<Vec<f32>> {
        let mut values = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let v = *layer.get((row, col))?;
            if !v.is_finite() {
                return None;
            }
            values.push(v);
        }
        Some(values)
    }

    pub fn target_value(&self, row: usize, col: usize) -> Option<f32> {
        self.target
            .as_ref()
            .and_then(|t| t.get((row, col)).copied())
            .filter(|v| v.is_finite())
    }

    /// Pixels with every feature and the target finite, in row-major order
    pub fn usable_pixels(&self) -> Vec<(usize, usize)> {
        let Some(target) = &self.target else {
            return Vec::new();
        };

        target
            .indexed_iter()
            .filter(|(_, t)| t.is_finite())
            .map(|(idx, _)| idx)
            .filter(|&(row, col)| self.layers.iter().all(|l| l[[row, col]].is_finite()))
            .collect()
    }
}

/// Aligns rasters on one grid and orders them into a [`FeatureStack`]
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    pub grid: GridSpec,
    pub policy: AlignmentPolicy,
    /// Reference pixels at or above this slope are dropped
    pub reference_slope_limit: Option<f32>,
}

impl FeatureAssembler {
    pub fn new(grid: GridSpec) -> Self {
        Self {
            grid,
            policy: AlignmentPolicy::default(),
            reference_slope_limit: None,
        }
    }

    pub fn assemble(
        &self,
        layers: Vec<(String, GeoRaster)>,
        target: Option<GeoRaster>,
        boundary: Option<&Boundary>,
    ) -> BiomassResult<FeatureStack> {
        log::info!("Assembling {} feature layers on {:?} grid", layers.len(), self.grid.shape);

        let mut named: Vec<(String, Band)> = Vec::with_capacity(layers.len());
        for (name, raster) in layers {
            if named.iter().any(|(n, _)| *n == name) {
                return Err(BiomassError::Processing(format!("duplicate feature layer {}", name)));
            }
            let aligned = self.align(&name, raster, boundary)?;
            named.push((name, aligned));
        }
        named.sort_by(|a, b| feature_rank(&a.0).cmp(&feature_rank(&b.0)));

        let mut target = match target {
            Some(raster) => Some(self.align("target", raster, boundary)?),
            None => None,
        };

        if let (Some(limit), Some(target)) = (self.reference_slope_limit, target.as_mut()) {
            match named.iter().find(|(n, _)| n == SLOPE_BAND) {
                Some((_, slope)) => {
                    let mask = QualityMask::slope_below(slope, limit);
                    let masked = QualityMask::apply_to_band(target, &mask)?;
                    log::info!("Reference slope limit {}: {} pixels masked", limit, masked);
                }
                None => log::warn!("Reference slope limit set but no {} layer present", SLOPE_BAND),
            }
        }

        let (names, layers): (Vec<String>, Vec<Band>) = named.into_iter().unzip();
        log::debug!("Feature order: {:?}", names);

        let stack = FeatureStack {
            grid: self.grid,
            names,
            layers,
            target,
        };
        if stack.target.is_some() {
            log::info!("{} usable training pixels", stack.usable_pixels().len());
        }
        Ok(stack)
    }

    fn align(&self, name: &str, raster: GeoRaster, boundary: Option<&Boundary>) -> BiomassResult<Band> {
        let mut raster = if raster.grid().matches(&self.grid) {
            raster
        } else {
            match self.policy {
                AlignmentPolicy::Strict => {
                    return Err(BiomassError::GridMismatch {
                        layer: name.to_string(),
                        expected: self.grid.shape,
                        found: raster.shape(),
                    })
                }
                AlignmentPolicy::Resample => {
                    log::debug!("Resampling {} from {:?} onto target grid", name, raster.shape());
                    resample_bilinear(&raster, &self.grid)
                }
            }
        };

        if let Some(boundary) = boundary {
            boundary.clip(&mut raster);
        }
        Ok(raster.data)
    }
}

/// Sort key for the fixed feature order: leading bands, other reflectance
/// bands, indices, elevation, slope, anything else
pub fn feature_rank(name: &str) -> (u8, usize, String) {
    if let Some(i) = LEADING_BANDS.iter().position(|b| *b == name) {
        return (0, i, String::new());
    }
    if crate::core::composite::is_reflectance_band(name) {
        let number = name[1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap_or(usize::MAX);
        return (1, number, name.to_string());
    }
    if let Some(index) = SpectralIndex::from_name(name) {
        let order = [
            SpectralIndex::Ndvi,
            SpectralIndex::Mndwi,
            SpectralIndex::Ndbi,
            SpectralIndex::Evi,
            SpectralIndex::Savi,
            SpectralIndex::Bsi,
            SpectralIndex::Gci,
            SpectralIndex::Arvi,
            SpectralIndex::Ndmi,
            SpectralIndex::Cire,
        ];
        let position = order.iter().position(|i| *i == index).unwrap_or(order.len());
        return (2, position, String::new());
    }
    match name {
        DEM_BAND => (3, 0, String::new()),
        SLOPE_BAND => (4, 0, String::new()),
        _ => (5, 0, name.to_string()),
    }
}
