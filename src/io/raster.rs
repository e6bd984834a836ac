use crate::types::{BiomassError, BiomassResult, GeoRaster, GeoTransform, EPSG_WGS84};
use gdal::raster::RasterCreationOption;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::Path;

/// Options for writing GeoTIFF files
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    /// Compression type: "DEFLATE", "LZW", "NONE"
    pub compression: String,
    /// Block size for tiled TIFFs (0 for strips)
    pub tile_size: usize,
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            tile_size: 256,
        }
    }
}

/// Read one band (1-indexed) of a raster file. The band's no-data value becomes NaN.
pub fn read_geotiff<P: AsRef<Path>>(path: P, band: usize) -> BiomassResult<GeoRaster> {
    log::debug!("Reading band {} of {}", band, path.as_ref().display());
    let dataset = Dataset::open(path.as_ref())?;
    let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let epsg = dataset_epsg(&dataset);
    let data = read_band(&dataset, band)?;
    Ok(GeoRaster::new(data, transform, epsg))
}

/// Read every band of a multi-band raster, named by the GDAL band description.
///
/// Bands without a description are named `band_<n>`.
pub fn read_named_bands<P: AsRef<Path>>(path: P) -> BiomassResult<Vec<(String, GeoRaster)>> {
    let dataset = Dataset::open(path.as_ref())?;
    let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let epsg = dataset_epsg(&dataset);
    let count = dataset.raster_count();

    let mut bands = Vec::new();
    for index in 1..=count {
        let rasterband = dataset.rasterband(index)?;
        let name = rasterband
            .description()
            .ok()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("band_{}", index));
        let data = read_band(&dataset, index as usize)?;
        bands.push((name, GeoRaster::new(data, transform, epsg)));
    }

    log::debug!(
        "Read {} bands from {}: {:?}",
        bands.len(),
        path.as_ref().display(),
        bands.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
    );
    Ok(bands)
}

fn read_band(dataset: &Dataset, band: usize) -> BiomassResult<Array2<f32>> {
    let (width, height) = dataset.raster_size();
    let rasterband = dataset.rasterband(band as isize)?;
    let buffer = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    let mut data = Array2::from_shape_vec((height, width), buffer.data)?;

    if let Some(no_data) = rasterband.no_data_value() {
        if no_data.is_finite() {
            let no_data = no_data as f32;
            data.mapv_inplace(|v| if v == no_data { f32::NAN } else { v });
        }
    }
    Ok(data)
}

fn dataset_epsg(dataset: &Dataset) -> u32 {
    dataset
        .spatial_ref()
        .and_then(|srs| srs.auth_code())
        .ok()
        .and_then(|code| u32::try_from(code).ok())
        .unwrap_or(EPSG_WGS84)
}

/// Write a single-band float GeoTIFF with NaN as no-data
pub fn write_geotiff<P: AsRef<Path>>(
    raster: &GeoRaster,
    output_path: P,
    options: Option<&GeoTiffOptions>,
) -> BiomassResult<()> {
    let default_options = GeoTiffOptions::default();
    let opts = options.unwrap_or(&default_options);
    log::info!("Saving GeoTIFF: {}", output_path.as_ref().display());

    if let Some(parent) = output_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (height, width) = raster.shape();
    if height == 0 || width == 0 {
        return Err(BiomassError::Processing(format!(
            "Refusing to write empty raster to {}",
            output_path.as_ref().display()
        )));
    }

    let tile_size = opts.tile_size.to_string();
    let mut creation_options = vec![RasterCreationOption {
        key: "COMPRESS",
        value: &opts.compression,
    }];
    // Tiled layout needs blocks no larger than the raster
    if opts.tile_size > 0 && opts.tile_size <= width.min(height) {
        creation_options.push(RasterCreationOption { key: "TILED", value: "YES" });
        creation_options.push(RasterCreationOption { key: "BLOCKXSIZE", value: &tile_size });
        creation_options.push(RasterCreationOption { key: "BLOCKYSIZE", value: &tile_size });
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
        &creation_options,
    )?;

    dataset.set_geo_transform(&raster.transform.to_gdal())?;
    dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(raster.epsg)?)?;

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<f32> = raster.data.iter().cloned().collect();
    let buffer = gdal::raster::Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;
    rasterband.set_no_data_value(Some(f32::NAN as f64))?;

    log::debug!("Wrote {}x{} raster", width, height);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use ndarray::array;

    #[test]
    fn test_write_then_read_keeps_nan_and_transform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("band.tif");

        let transform = GeoTransform::north_up(&BoundingBox::new(107.0, 107.3, 13.7, 14.0), 0.1);
        let raster = GeoRaster::new(array![[1.0f32, 2.0, 3.0], [4.0, f32::NAN, 6.0], [7.0, 8.0, 9.0]], transform, EPSG_WGS84);
        write_geotiff(&raster, &path, None).unwrap();

        let back = read_geotiff(&path, 1).unwrap();
        assert_eq!(back.shape(), (3, 3));
        assert_eq!(back.epsg, EPSG_WGS84);
        assert!(back.transform.approx_eq(&transform));
        assert!(back.data[[1, 1]].is_nan());
        assert_eq!(back.data[[2, 2]], 9.0);
    }

    #[test]
    fn test_empty_raster_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transform = GeoTransform::north_up(&BoundingBox::new(0.0, 1.0, 0.0, 1.0), 0.1);
        let raster = GeoRaster::new(Array2::zeros((0, 0)), transform, EPSG_WGS84);
        assert!(write_geotiff(&raster, dir.path().join("empty.tif"), None).is_err());
    }
}
