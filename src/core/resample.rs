use crate::types::{Band, GeoRaster, GridSpec};
use ndarray::Array2;

/// Resample a raster onto a target grid using bilinear interpolation.
///
/// Pixel centres are mapped through both transforms. When one of the four
/// neighbours is no-data the nearest source sample is used instead, so
/// masked areas do not bleed into valid ones. Target pixels outside the
/// source extent become NaN.
pub fn resample_bilinear(source: &GeoRaster, target: &GridSpec) -> GeoRaster {
    log::debug!(
        "Resampling {:?} raster onto target grid {:?}",
        source.shape(),
        target.shape
    );

    let (target_height, target_width) = target.shape;
    let (source_height, source_width) = source.shape();
    let mut resampled = Array2::from_elem(target.shape, f32::NAN);

    if source_height == 0 || source_width == 0 {
        return GeoRaster::new(resampled, target.transform, target.epsg);
    }

    for i in 0..target_height {
        for j in 0..target_width {
            let (x, y) = target.transform.pixel_center(i, j);
            let (col, row) = source.transform.world_to_pixel(x, y);

            // Position relative to source pixel centres
            let source_col = col - 0.5;
            let source_row = row - 0.5;

            if source_col < -0.5
                || source_row < -0.5
                || source_col > source_width as f64 - 0.5
                || source_row > source_height as f64 - 0.5
            {
                continue;
            }

            let x1 = source_col.floor().max(0.0) as usize;
            let y1 = source_row.floor().max(0.0) as usize;
            let x1 = x1.min(source_width - 1);
            let y1 = y1.min(source_height - 1);
            let x2 = (x1 + 1).min(source_width - 1);
            let y2 = (y1 + 1).min(source_height - 1);

            let dx = (source_col - x1 as f64).clamp(0.0, 1.0);
            let dy = (source_row - y1 as f64).clamp(0.0, 1.0);

            let v11 = source.data[[y1, x1]];
            let v12 = source.data[[y2, x1]];
            let v21 = source.data[[y1, x2]];
            let v22 = source.data[[y2, x2]];

            resampled[[i, j]] = if v11.is_finite() && v12.is_finite() && v21.is_finite() && v22.is_finite() {
                let interpolated = v11 as f64 * (1.0 - dx) * (1.0 - dy)
                    + v21 as f64 * dx * (1.0 - dy)
                    + v12 as f64 * (1.0 - dx) * dy
                    + v22 as f64 * dx * dy;
                interpolated as f32
            } else {
                let nearest_col = source_col.round().clamp(0.0, (source_width - 1) as f64) as usize;
                let nearest_row = source_row.round().clamp(0.0, (source_height - 1) as f64) as usize;
                source.data[[nearest_row, nearest_col]]
            };
        }
    }

    GeoRaster::new(resampled, target.transform, target.epsg)
}

/// Resample onto a target grid taking the source pixel under each target
/// centre. Used for categorical rasters such as land-cover classes.
pub fn resample_nearest(source: &GeoRaster, target: &GridSpec) -> GeoRaster {
    let (source_height, source_width) = source.shape();
    let resampled = Array2::from_shape_fn(target.shape, |(i, j)| {
        let (x, y) = target.transform.pixel_center(i, j);
        let (col, row) = source.transform.world_to_pixel(x, y);
        if col < 0.0 || row < 0.0 || col >= source_width as f64 || row >= source_height as f64 {
            f32::NAN
        } else {
            source.data[[row as usize, col as usize]]
        }
    });
    GeoRaster::new(resampled, target.transform, target.epsg)
}

/// Nearest-neighbour resize of a plain array to `shape` (rows, cols)
pub fn resize_nearest(data: &Band, shape: (usize, usize)) -> Band {
    let (src_rows, src_cols) = data.dim();
    let (rows, cols) = shape;
    if data.dim() == shape {
        return data.clone();
    }
    if src_rows == 0 || src_cols == 0 {
        return Array2::from_elem(shape, f32::NAN);
    }

    Array2::from_shape_fn(shape, |(i, j)| {
        let si = ((i as f64 + 0.5) * src_rows as f64 / rows as f64) as usize;
        let sj = ((j as f64 + 0.5) * src_cols as f64 / cols as f64) as usize;
        data[[si.min(src_rows - 1), sj.min(src_cols - 1)]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, EPSG_WGS84};
    use approx::assert_abs_diff_eq;

    fn ramp() -> GeoRaster {
        let data = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f32);
        GeoRaster::new(
            data,
            GeoTransform::north_up(&BoundingBox::new(0.0, 4.0, 0.0, 4.0), 1.0),
            EPSG_WGS84,
        )
    }

    #[test]
    fn test_identity_grid_keeps_values() {
        let source = ramp();
        let out = resample_bilinear(&source, &source.grid());
        assert_eq!(out.data, source.data);
    }

    #[test]
    fn test_half_pixel_shift_interpolates() {
        let source = ramp();
        let target = GridSpec {
            transform: GeoTransform::north_up(&BoundingBox::new(0.5, 3.5, 0.5, 3.5), 1.0),
            shape: (3, 3),
            epsg: EPSG_WGS84,
        };
        let out = resample_bilinear(&source, &target);
        // Centre of target (0,0) sits between source (0,0),(0,1),(1,0),(1,1)
        assert_abs_diff_eq!(out.data[[0, 0]], 2.5, epsilon = 1e-5);
    }

    #[test]
    fn test_outside_source_is_nan() {
        let source = ramp();
        let target = GridSpec {
            transform: GeoTransform::north_up(&BoundingBox::new(10.0, 12.0, 10.0, 12.0), 1.0),
            shape: (2, 2),
            epsg: EPSG_WGS84,
        };
        let out = resample_bilinear(&source, &target);
        assert!(out.data.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_nearest_keeps_class_values() {
        let source = ramp();
        let target = GridSpec {
            transform: GeoTransform::north_up(&BoundingBox::new(0.0, 4.0, 0.0, 4.0), 2.0),
            shape: (2, 2),
            epsg: EPSG_WGS84,
        };
        let out = resample_nearest(&source, &target);
        // Target centres fall on source pixel corners and pick the south-east pixel
        assert_eq!(out.data[[0, 0]], 5.0);
        assert_eq!(out.data[[1, 1]], 15.0);
    }

    #[test]
    fn test_resize_nearest_doubles() {
        let data = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let out = resize_nearest(&data, (4, 4));
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[1, 1]], 1.0);
        assert_eq!(out[[0, 3]], 2.0);
        assert_eq!(out[[3, 0]], 3.0);
        assert_eq!(out[[3, 3]], 4.0);
    }
}
