//! Next-close price predictors over the ML feature set.

pub mod boosting;
pub mod forest;
pub mod sequence_model;
pub mod tree;

use ndarray::{Array2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureError, FeatureSet, FeatureTable};
use crate::sequence::SequenceError;

pub use boosting::{BoostedTreesConfig, BoostedTreesModel, BoostedTreesPredictor};
pub use forest::{RandomForestConfig, RandomForestModel, RandomForestPredictor};
pub use sequence_model::{SequencePredictor, SequencePredictorConfig, SequencePredictorModel};

pub(crate) const TARGET_COLUMN: &str = "close_price";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictorKind {
    RandomForest,
    BoostedTrees,
    Sequence,
}

impl PredictorKind {
    pub const ALL: [PredictorKind; 3] = [
        PredictorKind::RandomForest,
        PredictorKind::BoostedTrees,
        PredictorKind::Sequence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RandomForest => "random_forest",
            Self::BoostedTrees => "boosted_trees",
            Self::Sequence => "sequence",
        }
    }

    pub fn model_name(self) -> &'static str {
        match self {
            Self::RandomForest => "predictor_random_forest",
            Self::BoostedTrees => "predictor_boosted_trees",
            Self::Sequence => "predictor_sequence",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "random_forest" | "rf" => Some(Self::RandomForest),
            "boosted_trees" | "xgb" | "xgboost" => Some(Self::BoostedTrees),
            "sequence" | "lstm" => Some(Self::Sequence),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid predictor config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error("insufficient history: need at least {required} rows, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error("model mismatch: {0}")]
    ModelMismatch(String),
    #[error("training diverged at epoch {epoch}")]
    TrainingDiverged { epoch: usize },
}

/// Train/predict contract shared by every price predictor.
pub trait PricePredictor {
    type Model: Serialize + DeserializeOwned;

    fn kind(&self) -> PredictorKind;

    fn train(&self, features: &FeatureTable) -> Result<Self::Model, PredictError>;

    /// Next-interval close price from the most recent rows of `features`.
    fn predict(&self, features: &FeatureTable, model: &Self::Model) -> Result<f64, PredictError>;
}

/// Feature rows paired with the following row's close inside one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct NextCloseDataset {
    pub inputs: Array2<f64>,
    pub targets: Vec<f64>,
}

pub fn next_close_dataset(features: &FeatureTable) -> Result<NextCloseDataset, PredictError> {
    features.require_set(FeatureSet::Ml)?;
    let close_idx = features
        .schema
        .column_index(TARGET_COLUMN)
        .ok_or_else(|| FeatureError::UnknownColumn(TARGET_COLUMN.to_string()))?;

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for segment in features.segments() {
        for idx in segment.start..segment.end.saturating_sub(1) {
            rows.push(idx);
            targets.push(features.rows[idx + 1].values[close_idx]);
        }
    }
    if rows.len() < 2 {
        return Err(PredictError::InsufficientHistory {
            required: 3,
            available: features.len(),
        });
    }

    let inputs = features.matrix().select(Axis(0), &rows);
    Ok(NextCloseDataset { inputs, targets })
}

pub(crate) fn check_model_compatible(
    features: &FeatureTable,
    fingerprint: &str,
    n_features: usize,
) -> Result<(), PredictError> {
    if features.feature_set() != FeatureSet::Ml {
        return Err(PredictError::ModelMismatch(format!(
            "predictor expects {} features, table holds {}",
            FeatureSet::Ml.as_str(),
            features.feature_set().as_str()
        )));
    }
    if features.schema.width() != n_features {
        return Err(PredictError::ModelMismatch(format!(
            "model trained on {n_features} columns, table has {}",
            features.schema.width()
        )));
    }
    if features.schema.fingerprint != fingerprint {
        return Err(PredictError::ModelMismatch(format!(
            "schema fingerprint {} does not match model fingerprint {fingerprint}",
            features.schema.fingerprint
        )));
    }
    Ok(())
}
