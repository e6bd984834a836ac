//! Random-forest regression
//!
//! CART regression trees grown on bootstrap samples and averaged. Splits
//! minimise the summed squared error of the two children, found by a sorted
//! sweep with prefix sums. Each tree draws from its own seeded generator, so
//! a forest is identical whether its trees are built sequentially or in
//! parallel.

use crate::types::{BiomassError, BiomassResult};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Estimator that can be fitted to a feature matrix and targets
pub trait Regressor {
    type Model: RegressionModel;

    fn fit(&self, features: ArrayView2<f32>, targets: ArrayView1<f32>) -> BiomassResult<Self::Model>;
}

/// Fitted model. Read-only and shareable across threads.
pub trait RegressionModel: Send + Sync {
    fn predict(&self, features: ArrayView2<f32>) -> BiomassResult<Array1<f32>>;

    fn n_features(&self) -> usize;
}

/// Random forest parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows trees until leaves are pure or too small
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    /// Fraction of features considered at each split, (0, 1]
    pub max_features: f64,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_leaf: 1,
            max_features: 1.0,
            bootstrap: true,
            seed: 42,
        }
    }
}

impl From<&crate::config::ModelConfig> for ForestParams {
    fn from(config: &crate::config::ModelConfig) -> Self {
        Self {
            n_trees: config.n_trees,
            max_depth: config.max_depth,
            min_samples_leaf: config.min_samples_leaf,
            max_features: config.max_features,
            bootstrap: true,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Node {
    Leaf {
        value: f32,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

/// Single CART regression tree stored as a flat node list, root at 0
#[derive(Debug, Clone)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f32,
    score: f64,
}

impl RegressionTree {
    fn grow(
        features: &ArrayView2<f32>,
        targets: &ArrayView1<f32>,
        sample: Vec<usize>,
        params: &ForestParams,
        rng: &mut StdRng,
    ) -> Self {
        let min_leaf = params.min_samples_leaf.max(1);
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut stack = vec![(0usize, sample, 0usize)];

        while let Some((node_id, indices, depth)) = stack.pop() {
            let value = mean(targets, &indices);
            let splittable = indices.len() >= 2 * min_leaf && params.max_depth.map_or(true, |d| depth < d);

            let split = if splittable {
                Self::best_split(features, targets, &indices, params, min_leaf, rng)
            } else {
                None
            };

            match split {
                Some(split) => {
                    let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
                        .into_iter()
                        .partition(|&i| features[[i, split.feature]] <= split.threshold);

                    let left = nodes.len();
                    let right = left + 1;
                    nodes.push(Node::Leaf { value });
                    nodes.push(Node::Leaf { value });
                    nodes[node_id] = Node::Split {
                        feature: split.feature,
                        threshold: split.threshold,
                        left,
                        right,
                    };
                    stack.push((right, right_indices, depth + 1));
                    stack.push((left, left_indices, depth + 1));
                }
                None => nodes[node_id] = Node::Leaf { value },
            }
        }

        Self { nodes }
    }

    fn best_split(
        features: &ArrayView2<f32>,
        targets: &ArrayView1<f32>,
        indices: &[usize],
        params: &ForestParams,
        min_leaf: usize,
        rng: &mut StdRng,
    ) -> Option<SplitCandidate> {
        let n = indices.len();
        let total: f64 = indices.iter().map(|&i| targets[i] as f64).sum();
        // Score of the unsplit node; a split must beat it
        let parent_score = total * total / n as f64;
        let mut best: Option<SplitCandidate> = None;

        let mut pairs: Vec<(f32, f32)> = Vec::with_capacity(n);
        for feature in candidate_features(features.ncols(), params.max_features, rng) {
            pairs.clear();
            pairs.extend(indices.iter().map(|&i| (features[[i, feature]], targets[i])));
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_sum = 0.0f64;
            for k in 0..n - 1 {
                left_sum += pairs[k].1 as f64;
                let (current, next) = (pairs[k].0, pairs[k + 1].0);
                if current == next {
                    continue;
                }

                let n_left = k + 1;
                let n_right = n - n_left;
                if n_left < min_leaf || n_right < min_leaf {
                    continue;
                }

                let right_sum = total - left_sum;
                let score = left_sum * left_sum / n_left as f64 + right_sum * right_sum / n_right as f64;
                if score <= parent_score + 1e-12 * parent_score.abs().max(1.0) {
                    continue;
                }

                if best.as_ref().map_or(true, |b| score > b.score) {
                    let mut threshold = current + (next - current) / 2.0;
                    if threshold >= next {
                        threshold = current;
                    }
                    best = Some(SplitCandidate { feature, threshold, score });
                }
            }
        }

        best
    }

    pub fn predict_row(&self, row: ArrayView1<f32>) -> f32 {
        let mut node = 0;
        loop {
            match self.nodes[node] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[feature] <= threshold { left } else { right };
                }
            }
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Node::Split { left, right, .. } = self.nodes[node] {
                stack.push((left, depth + 1));
                stack.push((right, depth + 1));
            }
        }
        max_depth
    }
}

fn mean(targets: &ArrayView1<f32>, indices: &[usize]) -> f32 {
    if indices.is_empty() {
        return 0.0;
    }
    let sum: f64 = indices.iter().map(|&i| targets[i] as f64).sum();
    (sum / indices.len() as f64) as f32
}

/// Features examined at one split. All of them when `fraction >= 1`.
fn candidate_features(n_features: usize, fraction: f64, rng: &mut StdRng) -> Vec<usize> {
    let mut all: Vec<usize> = (0..n_features).collect();
    if fraction >= 1.0 {
        return all;
    }

    let k = ((n_features as f64 * fraction).ceil() as usize).clamp(1, n_features);
    // Partial Fisher-Yates
    for i in 0..k {
        let j = rng.gen_range(i..n_features);
        all.swap(i, j);
    }
    all.truncate(k);
    all.sort_unstable();
    all
}

/// Random forest estimator
#[derive(Debug, Clone, Default)]
pub struct RandomForestRegressor {
    pub params: ForestParams,
}

impl RandomForestRegressor {
    pub fn new(params: ForestParams) -> Self {
        Self { params }
    }

    fn build_tree(&self, features: &ArrayView2<f32>, targets: &ArrayView1<f32>, tree_index: usize) -> RegressionTree {
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(tree_index as u64));
        let n = targets.len();
        let sample: Vec<usize> = if self.params.bootstrap {
            (0..n).map(|_| rng.gen_range(0..n)).collect()
        } else {
            (0..n).collect()
        };
        RegressionTree::grow(features, targets, sample, &self.params, &mut rng)
    }
}

impl Regressor for RandomForestRegressor {
    type Model = RandomForest;

    fn fit(&self, features: ArrayView2<f32>, targets: ArrayView1<f32>) -> BiomassResult<RandomForest> {
        let (n_samples, n_features) = features.dim();
        if n_samples == 0 {
            return Err(BiomassError::EmptyTrainingSet);
        }
        if targets.len() != n_samples {
            return Err(BiomassError::Model(format!(
                "{} feature rows but {} targets",
                n_samples,
                targets.len()
            )));
        }
        if n_features == 0 {
            return Err(BiomassError::Model("feature matrix has no columns".to_string()));
        }
        if self.params.n_trees == 0 {
            return Err(BiomassError::Model("forest needs at least one tree".to_string()));
        }
        if features.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
            return Err(BiomassError::Model("training data contains non-finite values".to_string()));
        }

        log::info!(
            "Fitting random forest: {} trees, {} samples, {} features",
            self.params.n_trees,
            n_samples,
            n_features
        );

        #[cfg(feature = "parallel")]
        let trees: Vec<RegressionTree> = (0..self.params.n_trees)
            .into_par_iter()
            .map(|t| self.build_tree(&features, &targets, t))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let trees: Vec<RegressionTree> = (0..self.params.n_trees)
            .map(|t| self.build_tree(&features, &targets, t))
            .collect();

        log::debug!(
            "Forest built: mean depth {:.1}, {} nodes total",
            trees.iter().map(|t| t.depth()).sum::<usize>() as f64 / trees.len() as f64,
            trees.iter().map(|t| t.n_nodes()).sum::<usize>()
        );

        Ok(RandomForest { trees, n_features })
    }
}

/// Fitted random forest
#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
    n_features: usize,
}

impl RandomForest {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

impl RegressionModel for RandomForest {
    fn predict(&self, features: ArrayView2<f32>) -> BiomassResult<Array1<f32>> {
        if features.ncols() != self.n_features {
            return Err(BiomassError::Model(format!(
                "model expects {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }

        let n_trees = self.trees.len() as f32;
        Ok(features
            .outer_iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f32>() / n_trees)
            .collect())
    }

    fn n_features(&self) -> usize {
        self.n_features
    }
}
