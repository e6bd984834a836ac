//! Block-wise prediction over the full extent
//!
//! Each square block is handled in two phases: collect the feature vectors of
//! eligible pixels, then predict them in one batch and scatter the values
//! back. Pixels that are excluded or incomplete stay NaN.

use crate::core::features::{FeatureStack, SLOPE_BAND};
use crate::core::forest::RegressionModel;
use crate::types::{BiomassError, BiomassResult, GeoRaster};
use ndarray::Array2;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Square window of the prediction grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub row_offset: usize,
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Blocks of at most `size` x `size` covering `shape` in row-major order
pub fn blocks(shape: (usize, usize), size: usize) -> Vec<Block> {
    let size = size.max(1);
    let (total_rows, total_cols) = shape;
    let mut out = Vec::new();

    for row_offset in (0..total_rows).step_by(size) {
        for col_offset in (0..total_cols).step_by(size) {
            out.push(Block {
                row_offset,
                col_offset,
                rows: size.min(total_rows - row_offset),
                cols: size.min(total_cols - col_offset),
            });
        }
    }
    out
}

/// Pixels never predicted: value of a named feature above a threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionRule {
    pub feature: String,
    pub threshold: f32,
}

impl ExclusionRule {
    /// Exclude slopes steeper than `threshold` degrees
    pub fn slope_above(threshold: f32) -> Self {
        Self {
            feature: SLOPE_BAND.to_string(),
            threshold,
        }
    }
}

/// Pixel accounting of one prediction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    pub blocks: usize,
    pub predicted: usize,
    pub excluded: usize,
    /// Pixels with at least one missing feature
    pub incomplete: usize,
}

impl PredictionStats {
    fn merge(&mut self, other: &PredictionStats) {
        self.blocks += other.blocks;
        self.predicted += other.predicted;
        self.excluded += other.excluded;
        self.incomplete += other.incomplete;
    }
}

struct BlockOutput {
    pixels: Vec<(usize, usize)>,
    values: Vec<f32>,
    stats: PredictionStats,
}

/// Applies a fitted model over a feature stack block by block
#[derive(Debug, Clone)]
pub struct BlockPredictor {
    pub block_size: usize,
    pub exclusion: Option<ExclusionRule>,
}

impl Default for BlockPredictor {
    fn default() -> Self {
        Self {
            block_size: 1000,
            exclusion: Some(ExclusionRule::slope_above(30.0)),
        }
    }
}

impl BlockPredictor {
    pub fn new(block_size: usize, exclusion: Option<ExclusionRule>) -> Self {
        Self { block_size, exclusion }
    }

    pub fn predict<M: RegressionModel + ?Sized>(
        &self,
        model: &M,
        stack: &FeatureStack,
    ) -> BiomassResult<(GeoRaster, PredictionStats)> {
        if model.n_features() != stack.n_features() {
            return Err(BiomassError::Model(format!(
                "model expects {} features, stack has {}",
                model.n_features(),
                stack.n_features()
            )));
        }

        let exclusion = match &self.exclusion {
            Some(rule) => {
                let index = stack.feature_index(&rule.feature).ok_or_else(|| {
                    BiomassError::Processing(format!("exclusion feature {} is not in the stack", rule.feature))
                })?;
                Some((index, rule.threshold))
            }
            None => None,
        };

        let shape = stack.shape();
        let blocks = blocks(shape, self.block_size);
        log::info!(
            "Predicting {}x{} grid in {} blocks of {}",
            shape.0,
            shape.1,
            blocks.len(),
            self.block_size
        );

        #[cfg(feature = "parallel")]
        let outputs: Vec<BiomassResult<BlockOutput>> = blocks
            .par_iter()
            .map(|block| Self::process_block(model, stack, block, exclusion))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let outputs: Vec<BiomassResult<BlockOutput>> = blocks
            .iter()
            .map(|block| Self::process_block(model, stack, block, exclusion))
            .collect();

        let mut prediction = Array2::from_elem(shape, f32::NAN);
        let mut stats = PredictionStats::default();
        for output in outputs {
            let output = output?;
            for (&(row, col), &value) in output.pixels.iter().zip(output.values.iter()) {
                prediction[[row, col]] = value;
            }
            stats.merge(&output.stats);
        }

        log::info!(
            "Prediction done: {} predicted, {} excluded, {} incomplete",
            stats.predicted,
            stats.excluded,
            stats.incomplete
        );
        if stats.incomplete > 0 {
            log::debug!("{} pixels skipped for missing features", stats.incomplete);
        }

        Ok((
            GeoRaster::new(prediction, stack.grid.transform, stack.grid.epsg),
            stats,
        ))
    }

    fn process_block<M: RegressionModel + ?Sized>(
        model: &M,
        stack: &FeatureStack,
        block: &Block,
        exclusion: Option<(usize, f32)>,
    ) -> BiomassResult<BlockOutput> {
        let mut stats = PredictionStats {
            blocks: 1,
            ..Default::default()
        };
        let n_features = stack.n_features();
        let mut pixels = Vec::new();
        let mut flat = Vec::new();

        // Collect
        for row in block.row_offset..block.row_offset + block.rows {
            for col in block.col_offset..block.col_offset + block.cols {
                if let Some((index, threshold)) = exclusion {
                    if stack.layers[index][[row, col]] > threshold {
                        stats.excluded += 1;
                        continue;
                    }
                }
                match stack.feature_vector(row, col) {
                    Some(vector) => {
                        flat.extend(vector);
                        pixels.push((row, col));
                    }
                    None => stats.incomplete += 1,
                }
            }
        }

        // Predict and write
        if pixels.is_empty() {
            return Ok(BlockOutput {
                pixels,
                values: Vec::new(),
                stats,
            });
        }

        let features = Array2::from_shape_vec((pixels.len(), n_features), flat)?;
        let values = model.predict(features.view())?.to_vec();
        stats.predicted = values.len();

        Ok(BlockOutput { pixels, values, stats })
    }
}
