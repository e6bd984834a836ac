use crate::types::{Band, BiomassError, BiomassResult};
use ndarray::{Array2, Zip};
use std::collections::BTreeMap;

/// Cloud score band name (Cloud Score+ style, 0 = cloudy, 1 = clear)
pub const CLOUD_SCORE_BAND: &str = "cs";
/// Reference biomass bands (GEDI L4A gridded product)
pub const AGBD_BAND: &str = "agbd";
pub const AGBD_SE_BAND: &str = "agbd_se";
pub const L4_QUALITY_FLAG_BAND: &str = "l4_quality_flag";
pub const DEGRADE_FLAG_BAND: &str = "degrade_flag";

/// Pixel-wise quality masks. `true` keeps a pixel.
pub struct QualityMask;

impl QualityMask {
    /// Keep optical pixels whose cloud score is at least `threshold`
    pub fn cloud_score(cs: &Band, threshold: f32) -> Array2<bool> {
        let mask = cs.mapv(|v| v.is_finite() && v >= threshold);
        Self::log_coverage("cloud score", &mask);
        mask
    }

    /// Keep reference pixels that pass the flag and relative error checks:
    /// `l4_quality_flag == 1`, `degrade_flag == 0`, `agbd_se / agbd <= max_relative_error`
    pub fn reference_quality(
        quality_flag: &Band,
        degrade_flag: &Band,
        agbd: &Band,
        agbd_se: &Band,
        max_relative_error: f32,
    ) -> BiomassResult<Array2<bool>> {
        let shape = agbd.dim();
        for (name, band) in [
            (L4_QUALITY_FLAG_BAND, quality_flag),
            (DEGRADE_FLAG_BAND, degrade_flag),
            (AGBD_SE_BAND, agbd_se),
        ] {
            if band.dim() != shape {
                return Err(BiomassError::Processing(format!(
                    "{} shape {:?} does not match agbd shape {:?}",
                    name,
                    band.dim(),
                    shape
                )));
            }
        }

        let mut mask = Array2::from_elem(shape, false);
        Zip::from(&mut mask)
            .and(quality_flag)
            .and(degrade_flag)
            .and(agbd)
            .and(agbd_se)
            .for_each(|keep, &q, &d, &value, &se| {
                let relative_se = se / value;
                *keep = q == 1.0
                    && d == 0.0
                    && value.is_finite()
                    && relative_se.is_finite()
                    && relative_se <= max_relative_error;
            });

        Self::log_coverage("reference quality", &mask);
        Ok(mask)
    }

    /// Keep pixels whose slope is strictly below `limit` degrees
    pub fn slope_below(slope: &Band, limit: f32) -> Array2<bool> {
        let mask = slope.mapv(|s| s.is_finite() && s < limit);
        Self::log_coverage("slope", &mask);
        mask
    }

    /// Set masked-out pixels to NaN in every band
    pub fn apply(bands: &mut BTreeMap<String, Band>, mask: &Array2<bool>) -> BiomassResult<usize> {
        let mut masked = 0;
        for (name, band) in bands.iter_mut() {
            masked = Self::apply_to_band(band, mask).map_err(|_| {
                BiomassError::Processing(format!(
                    "mask shape {:?} does not match band {} shape {:?}",
                    mask.dim(),
                    name,
                    band.dim()
                ))
            })?;
        }
        Ok(masked)
    }

    /// Set masked-out pixels to NaN; returns the number of masked pixels
    pub fn apply_to_band(band: &mut Band, mask: &Array2<bool>) -> BiomassResult<usize> {
        if band.dim() != mask.dim() {
            return Err(BiomassError::Processing(
                "Data and mask dimensions do not match".to_string(),
            ));
        }

        let mut masked_count = 0;
        Zip::from(band).and(mask).for_each(|v, &keep| {
            if !keep {
                *v = f32::NAN;
                masked_count += 1;
            }
        });
        Ok(masked_count)
    }

    fn log_coverage(kind: &str, mask: &Array2<bool>) {
        let total = mask.len().max(1);
        let kept = mask.iter().filter(|k| **k).count();
        log::debug!(
            "{} mask keeps {} of {} pixels ({:.2}%)",
            kind,
            kept,
            total,
            kept as f64 / total as f64 * 100.0
        );
    }
}
