//! Core biomass processing modules

pub mod indices;
pub mod quality;
pub mod resample;
pub mod terrain;
pub mod tiling;
pub mod composite;
pub mod features;
pub mod forest;
pub mod training;
pub mod prediction;

// Re-export main types
pub use indices::{SpectralIndex, compute_index, add_indices};
pub use quality::QualityMask;
pub use resample::{resample_bilinear, resample_nearest};
pub use terrain::TerrainAnalyzer;
pub use tiling::{TiledRetriever, TileSource, TileRequest, TileOutcome, RetrievalReport, RetrievedRaster};
pub use composite::{CompositeBuilder, Reducer};
pub use features::{FeatureAssembler, FeatureStack, AlignmentPolicy};
pub use forest::{RandomForestRegressor, RandomForest, ForestParams, Regressor, RegressionModel};
pub use training::{ModelTrainer, TrainingReport, TrainedModel, TrainingSample};
pub use prediction::{BlockPredictor, ExclusionRule, PredictionStats};
