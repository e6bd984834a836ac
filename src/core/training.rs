use crate::core::features::FeatureStack;
use crate::core::forest::{RegressionModel, Regressor};
use crate::types::{BiomassError, BiomassResult};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampled training pixels
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub features: Array2<f32>,
    pub targets: Array1<f32>,
    /// (row, col) of each sample, unique
    pub pixels: Vec<(usize, usize)>,
}

impl TrainingSample {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn subset(&self, indices: &[usize]) -> TrainingSample {
        TrainingSample {
            features: self.features.select(ndarray::Axis(0), indices),
            targets: self.targets.select(ndarray::Axis(0), indices),
            pixels: indices.iter().map(|&i| self.pixels[i]).collect(),
        }
    }
}

/// Fit quality of a trained model
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// RMSE over the samples the model was fitted on
    pub rmse: f64,
    /// RMSE over held-out samples, when a holdout fraction was set
    pub validation_rmse: Option<f64>,
    pub n_training: usize,
    pub n_validation: usize,
    /// (observed, predicted) over the training samples
    pub pairs: Vec<(f32, f32)>,
}

/// A trained model together with its report
pub struct TrainedModel<M> {
    pub model: M,
    pub report: TrainingReport,
}

/// Samples usable pixels and fits a regressor
#[derive(Debug, Clone)]
pub struct ModelTrainer<R> {
    pub regressor: R,
    pub sample_cap: usize,
    pub seed: u64,
    pub holdout_fraction: f64,
}

impl<R: Regressor> ModelTrainer<R> {
    pub fn new(regressor: R, sample_cap: usize, seed: u64) -> Self {
        Self {
            regressor,
            sample_cap,
            seed,
            holdout_fraction: 0.0,
        }
    }

    /// Up to `sample_cap` usable pixels drawn uniformly without replacement
    pub fn sample(&self, stack: &FeatureStack) -> BiomassResult<TrainingSample> {
        let usable = stack.usable_pixels();
        if usable.is_empty() {
            return Err(BiomassError::EmptyTrainingSet);
        }

        let chosen = sample_without_replacement(usable.len(), self.sample_cap, self.seed);
        log::info!("Sampled {} of {} usable pixels", chosen.len(), usable.len());

        let n_features = stack.n_features();
        let mut features = Array2::<f32>::zeros((chosen.len(), n_features));
        let mut targets = Array1::<f32>::zeros(chosen.len());
        let mut pixels = Vec::with_capacity(chosen.len());

        for (k, &i) in chosen.iter().enumerate() {
            let (row, col) = usable[i];
            let vector = stack
                .feature_vector(row, col)
                .ok_or_else(|| BiomassError::Processing(format!("pixel ({}, {}) lost a feature", row, col)))?;
            let target = stack
                .target_value(row, col)
                .ok_or_else(|| BiomassError::Processing(format!("pixel ({}, {}) has no target", row, col)))?;

            features.row_mut(k).assign(&Array1::from(vector));
            targets[k] = target;
            pixels.push((row, col));
        }

        Ok(TrainingSample {
            features,
            targets,
            pixels,
        })
    }

    /// Sample, fit and score
    pub fn train(&self, stack: &FeatureStack) -> BiomassResult<TrainedModel<R::Model>> {
        let sample = self.sample(stack)?;
        self.fit_sample(&sample)
    }

    pub fn fit_sample(&self, sample: &TrainingSample) -> BiomassResult<TrainedModel<R::Model>> {
        if sample.is_empty() {
            return Err(BiomassError::EmptyTrainingSet);
        }

        let (training, validation) = self.split_holdout(sample);
        let model = self.regressor.fit(training.features.view(), training.targets.view())?;

        let predicted = model.predict(training.features.view())?;
        let training_rmse = rmse(&training.targets, &predicted);

        let validation_rmse = match &validation {
            Some(held_out) => {
                let predicted = model.predict(held_out.features.view())?;
                Some(rmse(&held_out.targets, &predicted))
            }
            None => None,
        };

        log::info!("Training RMSE: {:.3} ({} samples)", training_rmse, training.len());
        if let Some(v) = validation_rmse {
            log::info!("Validation RMSE: {:.3}", v);
        }

        let pairs = training
            .targets
            .iter()
            .zip(predicted.iter())
            .map(|(&o, &p)| (o, p))
            .collect();

        Ok(TrainedModel {
            model,
            report: TrainingReport {
                rmse: training_rmse,
                validation_rmse,
                n_training: training.len(),
                n_validation: validation.as_ref().map_or(0, |v| v.len()),
                pairs,
            },
        })
    }

    fn split_holdout(&self, sample: &TrainingSample) -> (TrainingSample, Option<TrainingSample>) {
        let n = sample.len();
        let n_holdout = (n as f64 * self.holdout_fraction).floor() as usize;
        if n_holdout == 0 || n_holdout >= n {
            return (sample.clone(), None);
        }

        // Independent stream so the holdout does not repeat the sampling draw
        let held = sample_without_replacement(n, n_holdout, self.seed.wrapping_add(1));
        let mut is_held = vec![false; n];
        for &i in &held {
            is_held[i] = true;
        }
        let kept: Vec<usize> = (0..n).filter(|&i| !is_held[i]).collect();

        (sample.subset(&kept), Some(sample.subset(&held)))
    }
}

/// Sorted indices of `min(cap, n)` distinct draws from `0..n`.
///
/// Partial Fisher-Yates shuffle from a seeded generator.
pub fn sample_without_replacement(n: usize, cap: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    if cap >= n {
        return indices;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..cap {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(cap);
    indices.sort_unstable();
    indices
}

pub fn rmse(observed: &Array1<f32>, predicted: &Array1<f32>) -> f64 {
    if observed.is_empty() {
        return f64::NAN;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted.iter())
        .map(|(&o, &p)| {
            let d = o as f64 - p as f64;
            d * d
        })
        .sum();
    (sse / observed.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::FeatureStack;
    use crate::core::forest::{ForestParams, RandomForestRegressor};
    use crate::types::{BoundingBox, GeoTransform, GridSpec, EPSG_WGS84};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::collections::HashSet;

    fn stack(rows: usize, cols: usize) -> FeatureStack {
        let grid = GridSpec {
            transform: GeoTransform::north_up(&BoundingBox::new(0.0, cols as f64, 0.0, rows as f64), 1.0),
            shape: (rows, cols),
            epsg: EPSG_WGS84,
        };
        let feature = Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as f32);
        let mut target = feature.mapv(|v| 2.0 * v + 1.0);
        target[[0, 0]] = f32::NAN;

        FeatureStack {
            grid,
            names: vec!["ndvi".to_string()],
            layers: vec![feature],
            target: Some(target),
        }
    }

    fn trainer(cap: usize) -> ModelTrainer<RandomForestRegressor> {
        let forest = RandomForestRegressor::new(ForestParams {
            n_trees: 5,
            ..Default::default()
        });
        ModelTrainer::new(forest, cap, 42)
    }

    #[test]
    fn test_sample_without_replacement_is_unique_and_capped() {
        let picks = sample_without_replacement(1000, 100, 7);
        assert_eq!(picks.len(), 100);
        assert_eq!(picks.iter().collect::<HashSet<_>>().len(), 100);
        assert!(picks.iter().all(|&i| i < 1000));
        assert_eq!(picks, sample_without_replacement(1000, 100, 7));

        assert_eq!(sample_without_replacement(5, 100, 7), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sample_respects_cap_and_skips_missing_target() {
        let s = trainer(50).sample(&stack(20, 20)).unwrap();
        assert_eq!(s.len(), 50);
        assert_eq!(s.pixels.iter().collect::<HashSet<_>>().len(), 50);
        assert!(!s.pixels.contains(&(0, 0)));

        let all = trainer(100_000).sample(&stack(4, 4)).unwrap();
        assert_eq!(all.len(), 15);
    }

    #[test]
    fn test_empty_stack_is_rejected_before_fitting() {
        let mut empty = stack(3, 3);
        empty.target = Some(Array2::from_elem((3, 3), f32::NAN));
        assert!(matches!(trainer(10).train(&empty), Err(BiomassError::EmptyTrainingSet)));
    }

    #[test]
    fn test_train_reports_rmse_and_pairs() {
        let trained = trainer(1000).train(&stack(10, 10)).unwrap();
        assert_eq!(trained.report.n_training, 99);
        assert_eq!(trained.report.pairs.len(), 99);
        assert!(trained.report.rmse.is_finite());
        assert!(trained.report.rmse < 20.0);
        assert!(trained.report.validation_rmse.is_none());
    }

    #[test]
    fn test_holdout_split() {
        let mut t = trainer(1000);
        t.holdout_fraction = 0.2;
        let trained = t.train(&stack(10, 10)).unwrap();
        assert_eq!(trained.report.n_validation, 19);
        assert_eq!(trained.report.n_training, 80);
        assert!(trained.report.validation_rmse.is_some());
    }

    #[test]
    fn test_rmse() {
        assert_abs_diff_eq!(rmse(&array![1.0f32, 2.0, 3.0], &array![1.0f32, 2.0, 5.0]), (4.0f64 / 3.0).sqrt());
    }
}
