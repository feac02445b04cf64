//! Anomaly scorers over the anomaly feature set.

pub mod autoencoder;
pub mod isolation_forest;
pub mod zscore;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureError, FeatureRow, FeatureSet, FeatureTable};
use crate::sequence::SequenceError;

pub use autoencoder::{
    error_threshold, ReconstructionConfig, ReconstructionModel, ReconstructionScorer, ThresholdPolicy,
};
pub use isolation_forest::{DensityModel, DensityScorer, IsolationForestConfig};
pub use zscore::{zscore_anomalies, ZScoreAnomaly, DEFAULT_ZSCORE_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScorerKind {
    Density,
    Reconstruction,
}

impl ScorerKind {
    pub const ALL: [ScorerKind; 2] = [ScorerKind::Density, ScorerKind::Reconstruction];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Density => "density",
            Self::Reconstruction => "reconstruction",
        }
    }

    /// Key under which the trained model is persisted.
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Density => "anomaly_density",
            Self::Reconstruction => "anomaly_reconstruction",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "density" | "isoforest" | "isolation_forest" => Some(Self::Density),
            "reconstruction" | "lstm" | "autoencoder" => Some(Self::Reconstruction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scorer", rename_all = "snake_case")]
pub enum Verdict {
    Density {
        score: f64,
        threshold: f64,
        anomalous: bool,
    },
    Reconstruction {
        error: f64,
        threshold: f64,
        anomalous: bool,
        window_len: usize,
    },
}

impl Verdict {
    pub fn is_anomalous(&self) -> bool {
        match self {
            Self::Density { anomalous, .. } | Self::Reconstruction { anomalous, .. } => *anomalous,
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            Self::Density { threshold, .. } | Self::Reconstruction { threshold, .. } => *threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub row: FeatureRow,
    pub verdict: Verdict,
}

#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("invalid scorer config: {0}")]
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

/// Train/score contract shared by every anomaly scorer.
pub trait AnomalyScorer {
    type Model: Serialize + DeserializeOwned;

    fn kind(&self) -> ScorerKind;

    fn train(&self, features: &FeatureTable) -> Result<Self::Model, AnomalyError>;

    /// One record per scored row.
    fn score(&self, features: &FeatureTable, model: &Self::Model) -> Result<Vec<AnomalyRecord>, AnomalyError>;
}

pub fn flagged(records: &[AnomalyRecord]) -> Vec<&AnomalyRecord> {
    records.iter().filter(|r| r.verdict.is_anomalous()).collect()
}

/// Rejects a table whose schema differs from the one the model was trained on.
pub(crate) fn check_model_compatible(
    features: &FeatureTable,
    fingerprint: &str,
    n_features: usize,
) -> Result<(), AnomalyError> {
    if features.feature_set() != FeatureSet::Anomaly {
        return Err(AnomalyError::ModelMismatch(format!(
            "scorer expects {} features, table holds {}",
            FeatureSet::Anomaly.as_str(),
            features.feature_set().as_str()
        )));
    }
    if features.schema.width() != n_features {
        return Err(AnomalyError::ModelMismatch(format!(
            "model trained on {n_features} columns, table has {}",
            features.schema.width()
        )));
    }
    if features.schema.fingerprint != fingerprint {
        return Err(AnomalyError::ModelMismatch(format!(
            "schema fingerprint {} does not match model fingerprint {fingerprint}",
            features.schema.fingerprint
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scorer_kind_accepts_aliases() {
        assert_eq!(ScorerKind::parse("isoforest"), Some(ScorerKind::Density));
        assert_eq!(ScorerKind::parse(" LSTM "), Some(ScorerKind::Reconstruction));
        assert_eq!(ScorerKind::parse("xgboost"), None);
        for kind in ScorerKind::ALL {
            assert_eq!(ScorerKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let verdict = Verdict::Density {
            score: 0.7,
            threshold: 0.6,
            anomalous: true,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["scorer"], "density");
        assert!(verdict.is_anomalous());
    }
}
