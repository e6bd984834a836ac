use crate::core::prediction::PredictionStats;
use crate::core::training::TrainingReport;
use crate::io::raster::{write_geotiff, GeoTiffOptions};
use crate::types::{Band, BiomassError, BiomassResult, GeoRaster, GridSpec, METERS_PER_DEGREE};
use csv::Writer;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

pub const PREDICTION_FILE: &str = "biomass_prediction.tif";
pub const SUMMARY_FILE: &str = "biomass_summary.csv";
pub const SCATTER_PNG_FILE: &str = "model_scatter.png";
pub const SCATTER_CSV_FILE: &str = "model_scatter.csv";
pub const MAP_PNG_FILE: &str = "biomass_map.png";

/// Area in hectares of one pixel in each row of `grid`.
///
/// Geographic grids shrink east-west with the cosine of the row latitude.
pub fn pixel_area_ha(grid: &GridSpec) -> Vec<f64> {
    let gt = &grid.transform;
    (0..grid.shape.0)
        .map(|row| {
            let area_m2 = if grid.is_geographic() {
                let (_, lat) = gt.pixel_center(row, 0);
                (gt.pixel_width * METERS_PER_DEGREE).abs()
                    * (gt.pixel_height * METERS_PER_DEGREE).abs()
                    * lat.to_radians().cos()
            } else {
                (gt.pixel_width * gt.pixel_height).abs()
            };
            area_m2 / 10_000.0
        })
        .collect()
}

/// Land-cover restriction for the biomass total
#[derive(Debug, Clone)]
pub struct LandCoverMask<'a> {
    /// Class codes on the prediction grid
    pub classes: &'a Band,
    pub keep: &'a [u16],
}

/// Sum of predicted density (Mg/ha) times pixel area (ha), in Mg
pub fn total_biomass(prediction: &GeoRaster, land_cover: Option<&LandCoverMask>) -> BiomassResult<f64> {
    if let Some(mask) = land_cover {
        if mask.classes.dim() != prediction.shape() {
            return Err(BiomassError::GridMismatch {
                layer: "land cover".to_string(),
                expected: prediction.shape(),
                found: mask.classes.dim(),
            });
        }
    }

    let areas = pixel_area_ha(&prediction.grid());
    let mut total = 0.0f64;
    for ((row, col), &value) in prediction.data.indexed_iter() {
        if !value.is_finite() {
            continue;
        }
        if let Some(mask) = land_cover {
            let class = mask.classes[[row, col]];
            if !(class.is_finite() && mask.keep.iter().any(|&k| k as f32 == class)) {
                continue;
            }
        }
        total += value as f64 * areas[row];
    }
    Ok(total)
}

/// Values reported in the summary table
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryMetrics {
    pub rmse: f64,
    pub total_biomass_mg: f64,
    pub validation_rmse: Option<f64>,
    pub training_samples: usize,
    pub predicted_pixels: usize,
    pub excluded_pixels: usize,
}

impl SummaryMetrics {
    pub fn new(report: &TrainingReport, stats: &PredictionStats, total_biomass_mg: f64) -> Self {
        Self {
            rmse: report.rmse,
            total_biomass_mg,
            validation_rmse: report.validation_rmse,
            training_samples: report.n_training,
            predicted_pixels: stats.predicted,
            excluded_pixels: stats.excluded,
        }
    }

    /// (Metric, Value) rows in table order
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("RMSE", format!("{}", self.rmse)),
            ("Total_Biomass_Mg", format!("{}", self.total_biomass_mg)),
        ];
        if let Some(v) = self.validation_rmse {
            rows.push(("Validation_RMSE", format!("{}", v)));
        }
        rows.push(("Training_Samples", self.training_samples.to_string()));
        rows.push(("Predicted_Pixels", self.predicted_pixels.to_string()));
        rows.push(("Excluded_Pixels", self.excluded_pixels.to_string()));
        rows
    }
}

/// Paths of everything a run produced
#[derive(Debug, Clone, Default)]
pub struct WrittenOutputs {
    pub prediction: PathBuf,
    pub summary: PathBuf,
    pub map_png: PathBuf,
    pub scatter_png: Option<PathBuf>,
    pub scatter_csv: Option<PathBuf>,
}

/// Writes the final products into one directory
#[derive(Debug, Clone)]
pub struct ResultWriter {
    pub output_dir: PathBuf,
    pub geotiff: GeoTiffOptions,
}

impl ResultWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            geotiff: GeoTiffOptions::default(),
        }
    }

    pub fn write_all(
        &self,
        prediction: &GeoRaster,
        metrics: &SummaryMetrics,
        pairs: &[(f32, f32)],
    ) -> BiomassResult<WrittenOutputs> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut outputs = WrittenOutputs {
            prediction: self.write_prediction(prediction)?,
            summary: self.write_summary(metrics)?,
            map_png: self.write_map_png(prediction)?,
            ..Default::default()
        };

        if pairs.is_empty() {
            log::warn!("No observed/predicted pairs; scatter plot skipped");
        } else {
            outputs.scatter_csv = Some(self.write_scatter_csv(pairs)?);
            outputs.scatter_png = Some(self.write_scatter_png(pairs)?);
        }

        log::info!("Results written to {}", self.output_dir.display());
        Ok(outputs)
    }

    pub fn write_prediction(&self, prediction: &GeoRaster) -> BiomassResult<PathBuf> {
        let path = self.output_dir.join(PREDICTION_FILE);
        write_geotiff(prediction, &path, Some(&self.geotiff))?;
        Ok(path)
    }

    pub fn write_summary(&self, metrics: &SummaryMetrics) -> BiomassResult<PathBuf> {
        let path = self.output_dir.join(SUMMARY_FILE);
        let mut wtr = Writer::from_path(&path)?;
        wtr.write_record(["Metric", "Value"])?;
        for (metric, value) in metrics.rows() {
            wtr.write_record([metric, value.as_str()])?;
        }
        wtr.flush()?;
        log::info!("RMSE: {:.3}, total biomass: {:.1} Mg", metrics.rmse, metrics.total_biomass_mg);
        Ok(path)
    }

    pub fn write_map_png(&self, prediction: &GeoRaster) -> BiomassResult<PathBuf> {
        let path = self.output_dir.join(MAP_PNG_FILE);
        prediction_map(prediction).save(&path)?;
        Ok(path)
    }

    pub fn write_scatter_csv(&self, pairs: &[(f32, f32)]) -> BiomassResult<PathBuf> {
        let path = self.output_dir.join(SCATTER_CSV_FILE);
        let mut wtr = Writer::from_path(&path)?;
        wtr.write_record(["observed", "predicted"])?;
        for (observed, predicted) in pairs {
            wtr.write_record([observed.to_string(), predicted.to_string()])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    pub fn write_scatter_png(&self, pairs: &[(f32, f32)]) -> BiomassResult<PathBuf> {
        let path = self.output_dir.join(SCATTER_PNG_FILE);
        scatter_plot(pairs, 600).save(&path)?;
        Ok(path)
    }
}

/// One pixel per cell, pale yellow (lowest density) to dark green (highest).
/// No-data cells are white.
pub fn prediction_map(prediction: &GeoRaster) -> RgbImage {
    const LOW: [f64; 3] = [255.0, 255.0, 204.0];
    const HIGH: [f64; 3] = [0.0, 104.0, 55.0];

    let (rows, cols) = prediction.shape();
    let (lo, hi) = prediction
        .data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v as f64), hi.max(v as f64)));

    let mut img = RgbImage::from_pixel(cols.max(1) as u32, rows.max(1) as u32, Rgb([255, 255, 255]));
    for ((row, col), &value) in prediction.data.indexed_iter() {
        if !value.is_finite() {
            continue;
        }
        let t = if hi > lo { (value as f64 - lo) / (hi - lo) } else { 0.5 };
        let channel = |k: usize| (LOW[k] + (HIGH[k] - LOW[k]) * t).round() as u8;
        img.put_pixel(col as u32, row as u32, Rgb([channel(0), channel(1), channel(2)]));
    }
    img
}

/// Observed (x) against predicted (y) on shared axes, with the 1:1 line
pub fn scatter_plot(pairs: &[(f32, f32)], size: u32) -> RgbImage {
    const MARGIN: u32 = 40;
    let size = size.max(2 * MARGIN + 10);
    let mut img = RgbImage::from_pixel(size, size, Rgb([255, 255, 255]));
    let span = (size - 2 * MARGIN) as f64;

    let (lo, hi) = pairs
        .iter()
        .flat_map(|&(o, p)| [o, p])
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v as f64), hi.max(v as f64)));
    let (lo, hi) = if lo.is_finite() && hi > lo { (lo, hi) } else { (0.0, 1.0) };

    // Plot coordinates: x grows right, y grows up
    let to_px = |v: f64| ((v - lo) / (hi - lo) * span).round() as i64;
    let mut plot = |x: i64, y: i64, color: Rgb<u8>| {
        let px = MARGIN as i64 + x;
        let py = (size - MARGIN) as i64 - y;
        if px >= 0 && py >= 0 && (px as u32) < size && (py as u32) < size {
            img.put_pixel(px as u32, py as u32, color);
        }
    };

    let black = Rgb([0, 0, 0]);
    for t in 0..=span as i64 {
        plot(t, 0, black);
        plot(0, t, black);
    }

    let red = Rgb([200, 30, 30]);
    for t in 0..=span as i64 {
        plot(t, t, red);
    }

    let blue = Rgb([30, 80, 200]);
    for &(observed, predicted) in pairs {
        if !(observed.is_finite() && predicted.is_finite()) {
            continue;
        }
        let (x, y) = (to_px(observed as f64), to_px(predicted as f64));
        for dx in -1..=1 {
            for dy in -1..=1 {
                plot(x + dx, y + dy, blue);
            }
        }
    }

    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, EPSG_WGS84};
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    fn prediction(data: Band, epsg: u32, pixel: f64) -> GeoRaster {
        let (rows, cols) = data.dim();
        let bbox = BoundingBox::new(0.0, cols as f64 * pixel, 0.0, rows as f64 * pixel);
        GeoRaster::new(data, GeoTransform::north_up(&bbox, pixel), epsg)
    }

    #[test]
    fn test_projected_total_uses_pixel_area() {
        // 100 m pixels are 1 ha each
        let raster = prediction(array![[100.0f32, f32::NAN], [50.0, 25.0]], 32648, 100.0);
        assert_relative_eq!(total_biomass(&raster, None).unwrap(), 175.0);
    }

    #[test]
    fn test_geographic_area_follows_latitude() {
        let gt = GeoTransform::north_up(&BoundingBox::new(0.0, 0.001, 59.999, 60.0), 0.001);
        let grid = GridSpec { transform: gt, shape: (1, 1), epsg: EPSG_WGS84 };
        let side = 0.001 * METERS_PER_DEGREE;
        let expected = side * side * (59.9995f64).to_radians().cos() / 10_000.0;
        assert_relative_eq!(pixel_area_ha(&grid)[0], expected, epsilon = 1e-9);
    }

    #[test]
    fn test_land_cover_restricts_total() {
        let raster = prediction(array![[100.0f32, 100.0], [100.0, 100.0]], 32648, 100.0);
        let classes = array![[10.0f32, 50.0], [95.0, f32::NAN]];
        let mask = LandCoverMask { classes: &classes, keep: &[10, 20, 30, 40, 95] };
        assert_relative_eq!(total_biomass(&raster, Some(&mask)).unwrap(), 200.0);

        let wrong = Array2::zeros((1, 1));
        let bad = LandCoverMask { classes: &wrong, keep: &[10] };
        assert!(total_biomass(&raster, Some(&bad)).is_err());
    }

    #[test]
    fn test_summary_rows() {
        let metrics = SummaryMetrics {
            rmse: 12.5,
            total_biomass_mg: 1000.0,
            validation_rmse: None,
            training_samples: 10,
            predicted_pixels: 20,
            excluded_pixels: 3,
        };
        let names: Vec<&str> = metrics.rows().iter().map(|(m, _)| *m).collect();
        assert_eq!(
            names,
            vec!["RMSE", "Total_Biomass_Mg", "Training_Samples", "Predicted_Pixels", "Excluded_Pixels"]
        );
    }

    #[test]
    fn test_write_all() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::new(dir.path().join("results"));
        let raster = prediction(array![[1.0f32, 2.0], [3.0, f32::NAN]], EPSG_WGS84, 0.001);
        let metrics = SummaryMetrics {
            rmse: 1.25,
            total_biomass_mg: 42.0,
            validation_rmse: Some(2.0),
            training_samples: 3,
            predicted_pixels: 3,
            excluded_pixels: 1,
        };

        let outputs = writer.write_all(&raster, &metrics, &[(1.0, 1.1), (3.0, 2.7)]).unwrap();
        assert!(outputs.prediction.exists());
        assert!(outputs.map_png.exists());
        assert!(outputs.scatter_png.unwrap().exists());

        let summary = std::fs::read_to_string(outputs.summary).unwrap();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "Metric,Value");
        assert_eq!(lines[1], "RMSE,1.25");
        assert_eq!(lines[2], "Total_Biomass_Mg,42");
        assert_eq!(lines[3], "Validation_RMSE,2");

        let scatter = std::fs::read_to_string(outputs.scatter_csv.unwrap()).unwrap();
        assert_eq!(scatter.lines().count(), 3);
    }

    #[test]
    fn test_prediction_map_colours() {
        let raster = prediction(array![[10.0f32, 20.0, 30.0], [f32::NAN, 20.0, 10.0]], EPSG_WGS84, 0.001);
        let img = prediction_map(&raster);
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(*img.get_pixel(0, 0), Rgb([255, 255, 204]));
        assert_eq!(*img.get_pixel(2, 0), Rgb([0, 104, 55]));
        assert_eq!(*img.get_pixel(0, 1), Rgb([255, 255, 255]));
        assert_eq!(img.get_pixel(1, 0), img.get_pixel(1, 1));
    }

    #[test]
    fn test_scatter_plot_draws_diagonal() {
        let img = scatter_plot(&[(0.0, 0.0), (10.0, 10.0)], 200);
        assert_eq!(img.dimensions(), (200, 200));
        // Middle of the 1:1 line
        assert_eq!(*img.get_pixel(100, 100), Rgb([200, 30, 30]));
    }
}
