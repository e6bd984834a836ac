//! Spectral indices derived from scaled surface reflectance
//!
//! Band naming follows Sentinel-2: B2 blue, B3 green, B4 red, B5 red edge,
//! B8 near infrared, B11 short-wave infrared.

use crate::types::{Band, BiomassError, BiomassResult};
use ndarray::{Array2, Axis, Zip};
use num_traits::Float;
use std::collections::BTreeMap;

/// Soil brightness correction factor for SAVI
pub const SAVI_L: f64 = 0.5;

/// Supported spectral indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectralIndex {
    /// Normalized difference vegetation index, ND(B8, B4)
    Ndvi,
    /// Modified normalized difference water index, ND(B3, B11)
    Mndwi,
    /// Normalized difference built-up index, ND(B11, B8)
    Ndbi,
    /// Enhanced vegetation index
    Evi,
    /// Soil adjusted vegetation index
    Savi,
    /// Bare soil index
    Bsi,
    /// Green chlorophyll index
    Gci,
    /// Atmospherically resistant vegetation index
    Arvi,
    /// Normalized difference moisture index, ND(B8, B11)
    Ndmi,
    /// Red-edge chlorophyll index
    Cire,
}

impl SpectralIndex {
    /// Indices every optical composite carries
    pub const STANDARD: [SpectralIndex; 4] = [
        SpectralIndex::Ndvi,
        SpectralIndex::Mndwi,
        SpectralIndex::Ndbi,
        SpectralIndex::Evi,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "ndvi",
            SpectralIndex::Mndwi => "mndwi",
            SpectralIndex::Ndbi => "ndbi",
            SpectralIndex::Evi => "evi",
            SpectralIndex::Savi => "savi",
            SpectralIndex::Bsi => "bsi",
            SpectralIndex::Gci => "gci",
            SpectralIndex::Arvi => "arvi",
            SpectralIndex::Ndmi => "ndmi",
            SpectralIndex::Cire => "cire",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ndvi" => Some(SpectralIndex::Ndvi),
            "mndwi" => Some(SpectralIndex::Mndwi),
            "ndbi" => Some(SpectralIndex::Ndbi),
            "evi" => Some(SpectralIndex::Evi),
            "savi" => Some(SpectralIndex::Savi),
            "bsi" => Some(SpectralIndex::Bsi),
            "gci" => Some(SpectralIndex::Gci),
            "arvi" => Some(SpectralIndex::Arvi),
            "ndmi" => Some(SpectralIndex::Ndmi),
            "cire" => Some(SpectralIndex::Cire),
            _ => None,
        }
    }

    /// Input bands in the order [`SpectralIndex::evaluate`] expects them
    pub fn required_bands(&self) -> &'static [&'static str] {
        match self {
            SpectralIndex::Ndvi => &["B8", "B4"],
            SpectralIndex::Mndwi => &["B3", "B11"],
            SpectralIndex::Ndbi => &["B11", "B8"],
            SpectralIndex::Evi => &["B8", "B4", "B2"],
            SpectralIndex::Savi => &["B8", "B4"],
            SpectralIndex::Bsi => &["B11", "B4", "B8", "B2"],
            SpectralIndex::Gci => &["B8", "B3"],
            SpectralIndex::Arvi => &["B8", "B4", "B2"],
            SpectralIndex::Ndmi => &["B8", "B11"],
            SpectralIndex::Cire => &["B5", "B4"],
        }
    }

    /// Evaluate on one pixel; `v` holds the values of [`Self::required_bands`]
    pub fn evaluate<T: Float>(&self, v: &[T]) -> T {
        match self {
            SpectralIndex::Ndvi
            | SpectralIndex::Mndwi
            | SpectralIndex::Ndbi
            | SpectralIndex::Ndmi => normalized_difference(v[0], v[1]),
            SpectralIndex::Evi => evi(v[0], v[1], v[2]),
            SpectralIndex::Savi => savi(v[0], v[1]),
            SpectralIndex::Bsi => bsi(v[0], v[1], v[2], v[3]),
            SpectralIndex::Gci => gci(v[0], v[1]),
            SpectralIndex::Arvi => arvi(v[0], v[1], v[2]),
            SpectralIndex::Cire => cire(v[0], v[1]),
        }
    }
}

impl std::fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[inline]
fn ratio<T: Float>(num: T, den: T) -> T {
    if !num.is_finite() || !den.is_finite() || den == T::zero() {
        T::nan()
    } else {
        num / den
    }
}

/// `(a - b) / (a + b)`; NaN when the sum is zero or an input is missing
#[inline]
pub fn normalized_difference<T: Float>(a: T, b: T) -> T {
    ratio(a - b, a + b)
}

/// `2.5 * (NIR - RED) / (NIR + 6 RED - 7.5 BLUE + 1)`
#[inline]
pub fn evi<T: Float>(nir: T, red: T, blue: T) -> T {
    let c = |x: f64| num_traits::cast::<f64, T>(x).unwrap_or_else(T::nan);
    let den = nir + c(6.0) * red - c(7.5) * blue + T::one();
    c(2.5) * ratio(nir - red, den)
}

/// `((NIR - RED) / (NIR + RED + L)) * (1 + L)`
#[inline]
pub fn savi<T: Float>(nir: T, red: T) -> T {
    let l = num_traits::cast::<f64, T>(SAVI_L).unwrap_or_else(T::nan);
    ratio(nir - red, nir + red + l) * (T::one() + l)
}

/// `((SWIR + RED) - (NIR + BLUE)) / ((SWIR + RED) + (NIR + BLUE))`
#[inline]
pub fn bsi<T: Float>(swir: T, red: T, nir: T, blue: T) -> T {
    normalized_difference(swir + red, nir + blue)
}

/// `NIR / GREEN - 1`
#[inline]
pub fn gci<T: Float>(nir: T, green: T) -> T {
    ratio(nir, green) - T::one()
}

/// `(NIR - (2 RED - BLUE)) / (NIR + (2 RED - BLUE))`
#[inline]
pub fn arvi<T: Float>(nir: T, red: T, blue: T) -> T {
    let rb = (red + red) - blue;
    normalized_difference(nir, rb)
}

/// `(RED_EDGE - RED) / RED`
#[inline]
pub fn cire<T: Float>(red_edge: T, red: T) -> T {
    ratio(red_edge - red, red)
}

/// Compute an index map from named bands of equal shape
pub fn compute_index(index: SpectralIndex, bands: &BTreeMap<String, Band>) -> BiomassResult<Band> {
    let inputs: Vec<&Band> = index
        .required_bands()
        .iter()
        .map(|name| {
            bands.get(*name).ok_or_else(|| {
                BiomassError::InvalidFormat(format!("{} requires band {}", index, name))
            })
        })
        .collect::<BiomassResult<_>>()?;

    let shape = inputs[0].dim();
    if let Some(bad) = inputs.iter().find(|b| b.dim() != shape) {
        return Err(BiomassError::Processing(format!(
            "{} input bands differ in shape: {:?} vs {:?}",
            index,
            shape,
            bad.dim()
        )));
    }

    let mut out = Array2::<f32>::from_elem(shape, f32::NAN);

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut line)| fill_index_row(index, &inputs, row, line.view_mut()));
    }

    #[cfg(not(feature = "parallel"))]
    {
        for (row, mut line) in out.axis_iter_mut(Axis(0)).enumerate() {
            fill_index_row(index, &inputs, row, line.view_mut());
        }
    }

    Ok(out)
}

fn fill_index_row(
    index: SpectralIndex,
    inputs: &[&Band],
    row: usize,
    mut line: ndarray::ArrayViewMut1<f32>,
) {
    let mut values = [0.0f32; 4];
    for (col, cell) in line.iter_mut().enumerate() {
        for (k, band) in inputs.iter().enumerate() {
            values[k] = band[[row, col]];
        }
        *cell = index.evaluate(&values[..inputs.len()]);
    }
}

/// Add the standard indices plus `extra` to a set of scaled reflectance bands
pub fn add_indices(bands: &mut BTreeMap<String, Band>, extra: &[SpectralIndex]) -> BiomassResult<()> {
    let mut wanted: Vec<SpectralIndex> = SpectralIndex::STANDARD.to_vec();
    for index in extra {
        if !wanted.contains(index) {
            wanted.push(*index);
        }
    }

    for index in wanted {
        let map = compute_index(index, bands)?;
        bands.insert(index.name().to_string(), map);
    }
    Ok(())
}

/// Multiply every sample by `scale` in place (digital numbers to reflectance)
pub fn scale_reflectance(band: &mut Band, scale: f32) {
    Zip::from(band).for_each(|v| *v *= scale);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_ndvi_reference_value() {
        let ndvi: f64 = normalized_difference(0.4, 0.2);
        assert_abs_diff_eq!(ndvi, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_evi_reference_value() {
        let value: f64 = evi(0.4, 0.2, 0.1);
        assert_abs_diff_eq!(value, 2.5 * 0.2 / 1.65, epsilon = 1e-12);
        assert_abs_diff_eq!(value, 0.30303, epsilon = 1e-5);
    }

    #[test]
    fn test_zero_denominator_is_nan() {
        assert!(normalized_difference(0.0f32, 0.0).is_nan());
        assert!(gci(0.3f32, 0.0).is_nan());
        assert!(normalized_difference(f32::NAN, 0.2).is_nan());
    }

    #[test]
    fn test_supplementary_indices() {
        assert_abs_diff_eq!(savi(0.4f64, 0.2), (0.2 / 1.1) * 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(gci(0.4f64, 0.1), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cire(0.3f64, 0.2), 0.5, epsilon = 1e-12);
        // 2*RED - BLUE = 0.3
        assert_abs_diff_eq!(arvi(0.4f64, 0.2, 0.1), 0.1 / 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(bsi(0.3f64, 0.2, 0.4, 0.1), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_index_names_round_trip() {
        for index in [SpectralIndex::Ndvi, SpectralIndex::Savi, SpectralIndex::Cire] {
            assert_eq!(SpectralIndex::from_name(index.name()), Some(index));
        }
        assert_eq!(SpectralIndex::from_name("EVI"), Some(SpectralIndex::Evi));
        assert_eq!(SpectralIndex::from_name("ndwi"), None);
    }

    #[test]
    fn test_add_indices_to_band_set() {
        let mut bands = BTreeMap::new();
        for (name, value) in [("B2", 0.1f32), ("B3", 0.15), ("B4", 0.2), ("B8", 0.4), ("B11", 0.25)] {
            bands.insert(name.to_string(), Array2::from_elem((3, 4), value));
        }

        add_indices(&mut bands, &[SpectralIndex::Savi]).unwrap();

        let ndvi = &bands["ndvi"];
        assert_eq!(ndvi.dim(), (3, 4));
        assert_abs_diff_eq!(ndvi[[1, 2]], 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bands["evi"][[0, 0]], 0.303_030_3, epsilon = 1e-5);
        assert!(bands.contains_key("mndwi"));
        assert!(bands.contains_key("ndbi"));
        assert!(bands.contains_key("savi"));
    }

    #[test]
    fn test_missing_band_is_reported() {
        let mut bands = BTreeMap::new();
        bands.insert("B8".to_string(), Array2::from_elem((2, 2), 0.4f32));
        assert!(compute_index(SpectralIndex::Ndvi, &bands).is_err());
    }
}
