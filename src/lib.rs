//! biomap: above-ground biomass mapping
//!
//! Builds optical, elevation and LiDAR reference composites over a study
//! boundary, trains a random-forest regressor on the reference pixels and
//! predicts biomass density over the full extent.

pub mod types;
pub mod config;
pub mod io;
pub mod core;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, GeoTransform, GeoRaster, GridSpec, DateRange, SourceKind, Composite,
    BiomassError, BiomassResult,
};
pub use config::PipelineConfig;
pub use io::{Boundary, BoundaryResolver, LocalCatalog, HttpTileSource, ResultWriter};
pub use pipeline::{Pipeline, PipelineSummary, TileSourceFactory};

#[cfg(feature = "python")]
mod python {
    use crate::core::indices::{compute_index as compute_band_index, SpectralIndex};
    use crate::{BiomassError, BoundingBox, Pipeline, PipelineConfig};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;
    use std::collections::{BTreeMap, HashMap};

    fn to_py_err(e: BiomassError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(compute_index, m)?)?;
        m.add_function(wrap_pyfunction!(partition_bbox, m)?)?;
        m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
        Ok(())
    }

    /// Compute a spectral index from named reflectance arrays
    #[pyfunction]
    fn compute_index<'py>(
        py: Python<'py>,
        name: &str,
        bands: HashMap<String, PyReadonlyArray2<'py, f32>>,
    ) -> PyResult<&'py PyArray2<f32>> {
        let index = SpectralIndex::from_name(name).ok_or_else(|| {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("Unknown index: {}", name))
        })?;
        let owned: BTreeMap<String, _> = bands
            .iter()
            .map(|(k, v)| (k.clone(), v.as_array().to_owned()))
            .collect();
        let result = compute_band_index(index, &owned).map_err(to_py_err)?;
        Ok(result.into_pyarray(py))
    }

    /// Split a bounding box into an n x n grid of (row, col, bbox) cells
    #[pyfunction]
    fn partition_bbox(
        min_lon: f64,
        max_lon: f64,
        min_lat: f64,
        max_lat: f64,
        n: usize,
    ) -> Vec<(usize, usize, (f64, f64, f64, f64))> {
        BoundingBox::new(min_lon, max_lon, min_lat, max_lat)
            .partition(n)
            .into_iter()
            .map(|(r, c, b)| (r, c, (b.min_lon, b.max_lon, b.min_lat, b.max_lat)))
            .collect()
    }

    /// Run the whole workflow from a JSON configuration file
    #[pyfunction]
    fn run_pipeline(py: Python<'_>, config_path: &str) -> PyResult<HashMap<String, f64>> {
        let config = PipelineConfig::from_file(config_path).map_err(to_py_err)?;
        let summary = py
            .allow_threads(|| Pipeline::new(config)?.run())
            .map_err(to_py_err)?;

        let mut out = HashMap::new();
        out.insert("rmse".to_string(), summary.training.rmse);
        out.insert("total_biomass_mg".to_string(), summary.total_biomass_mg);
        out.insert("training_samples".to_string(), summary.training.n_training as f64);
        out.insert("predicted_pixels".to_string(), summary.prediction.predicted as f64);
        if let Some(v) = summary.training.validation_rmse {
            out.insert("validation_rmse".to_string(), v);
        }
        Ok(out)
    }
}
