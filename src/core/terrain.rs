use crate::types::{Band, BiomassError, BiomassResult, GeoRaster, METERS_PER_DEGREE};
use ndarray::Array2;

/// Slope computation from an elevation raster
pub struct TerrainAnalyzer;

impl TerrainAnalyzer {
    /// Slope in degrees using central differences.
    ///
    /// Geographic grids convert pixel size to meters with [`METERS_PER_DEGREE`]
    /// and the cosine of each row's latitude for the east-west spacing.
    pub fn slope_degrees(dem: &GeoRaster) -> BiomassResult<GeoRaster> {
        log::debug!("Calculating slope from {:?} elevation grid", dem.shape());

        let (height, width) = dem.shape();
        if height < 3 || width < 3 {
            return Err(BiomassError::Processing(format!(
                "Elevation raster {}x{} is too small for slope computation",
                height, width
            )));
        }

        let geographic = dem.grid().is_geographic();
        let gt = &dem.transform;
        let mut slope = Array2::from_elem((height, width), f32::NAN);

        for i in 1..height - 1 {
            let (dx, dy) = if geographic {
                let (_, lat) = gt.pixel_center(i, 0);
                (
                    gt.pixel_width.abs() * METERS_PER_DEGREE * lat.to_radians().cos(),
                    gt.pixel_height.abs() * METERS_PER_DEGREE,
                )
            } else {
                (gt.pixel_width.abs(), gt.pixel_height.abs())
            };
            let (dx, dy) = (dx as f32, dy as f32);

            for j in 1..width - 1 {
                let dz_dx = (dem.data[[i, j + 1]] - dem.data[[i, j - 1]]) / (2.0 * dx);
                let dz_dy = (dem.data[[i + 1, j]] - dem.data[[i - 1, j]]) / (2.0 * dy);
                slope[[i, j]] = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
            }
        }

        Self::fill_edge_values(&mut slope);

        Ok(GeoRaster::new(slope, dem.transform, dem.epsg))
    }

    /// Fill edge values by copying from nearest interior pixels
    fn fill_edge_values(array: &mut Band) {
        let (height, width) = array.dim();

        for j in 0..width {
            array[[0, j]] = array[[1, j]];
            array[[height - 1, j]] = array[[height - 2, j]];
        }

        for i in 0..height {
            array[[i, 0]] = array[[i, 1]];
            array[[i, width - 1]] = array[[i, width - 2]];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_tilted_plane_slope() {
        // 30 m pixels in a projected grid, rising 30 m per pixel eastwards: 45 degrees
        let dem = Array2::from_shape_fn((5, 5), |(_, j)| j as f32 * 30.0);
        let gt = GeoTransform::north_up(&BoundingBox::new(0.0, 150.0, 0.0, 150.0), 30.0);
        let raster = GeoRaster::new(dem, gt, 32648);

        let slope = TerrainAnalyzer::slope_degrees(&raster).unwrap();
        assert_eq!(slope.shape(), (5, 5));
        assert_abs_diff_eq!(slope.data[[2, 2]], 45.0, epsilon = 1e-3);
        assert_abs_diff_eq!(slope.data[[0, 0]], 45.0, epsilon = 1e-3);
    }

    #[test]
    fn test_flat_geographic_dem() {
        let dem = Array2::from_elem((4, 4), 500.0f32);
        let gt = GeoTransform::north_up(&BoundingBox::new(107.0, 107.004, 13.0, 13.004), 0.001);
        let slope = TerrainAnalyzer::slope_degrees(&GeoRaster::new(dem, gt, 4326)).unwrap();
        assert!(slope.data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_void_propagates_nan() {
        let mut dem = Array2::from_elem((5, 5), 100.0f32);
        dem[[2, 3]] = f32::NAN;
        let gt = GeoTransform::north_up(&BoundingBox::new(0.0, 5.0, 0.0, 5.0), 1.0);
        let slope = TerrainAnalyzer::slope_degrees(&GeoRaster::new(dem, gt, 32648)).unwrap();
        assert!(slope.data[[2, 2]].is_nan());
        assert_eq!(slope.data[[1, 1]], 0.0);
    }

    #[test]
    fn test_too_small_dem() {
        let gt = GeoTransform::north_up(&BoundingBox::new(0.0, 2.0, 0.0, 2.0), 1.0);
        let raster = GeoRaster::new(Array2::zeros((2, 2)), gt, 32648);
        assert!(TerrainAnalyzer::slope_degrees(&raster).is_err());
    }
}
