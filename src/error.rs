use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anomaly::AnomalyError;
use crate::chat::ChatError;
use crate::features::FeatureError;
use crate::market_data::MarketDataError;
use crate::predict::PredictError;
use crate::retrieval::RetrievalError;
use crate::sequence::SequenceError;
use crate::store::StoreError;

/// Caller-facing classification of every pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataUnavailable,
    InvalidData,
    InsufficientHistory,
    ModelNotFound,
    ModelMismatch,
    DegenerateVector,
    InvalidInput,
    TrainingFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataUnavailable => "data_unavailable",
            Self::InvalidData => "invalid_data",
            Self::InsufficientHistory => "insufficient_history",
            Self::ModelNotFound => "model_not_found",
            Self::ModelMismatch => "model_mismatch",
            Self::DegenerateVector => "degenerate_vector",
            Self::InvalidInput => "invalid_input",
            Self::TrainingFailed => "training_failed",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Anomaly(#[from] AnomalyError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("model mismatch: {0}")]
    ModelMismatch(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MarketData(err) => market_data_kind(err),
            Self::Feature(err) => feature_kind(err),
            Self::Sequence(err) => sequence_kind(err),
            Self::Anomaly(err) => match err {
                AnomalyError::Feature(inner) => feature_kind(inner),
                AnomalyError::Sequence(inner) => sequence_kind(inner),
                AnomalyError::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
                AnomalyError::ModelMismatch(_) => ErrorKind::ModelMismatch,
                AnomalyError::TrainingDiverged { .. } => ErrorKind::TrainingFailed,
                AnomalyError::InvalidConfig(_) => ErrorKind::Internal,
            },
            Self::Predict(err) => match err {
                PredictError::Feature(inner) => feature_kind(inner),
                PredictError::Sequence(inner) => sequence_kind(inner),
                PredictError::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
                PredictError::ModelMismatch(_) => ErrorKind::ModelMismatch,
                PredictError::TrainingDiverged { .. } => ErrorKind::TrainingFailed,
                PredictError::InvalidConfig(_) => ErrorKind::Internal,
            },
            Self::Store(err) => match err {
                StoreError::NotFound(_) => ErrorKind::ModelNotFound,
                StoreError::Incompatible { .. } => ErrorKind::ModelMismatch,
                StoreError::DimensionMismatch { .. } => ErrorKind::InvalidInput,
                StoreError::InvalidEmbedding(_) => ErrorKind::DegenerateVector,
                StoreError::Sqlite(_) | StoreError::Io(_) | StoreError::Serde(_) => ErrorKind::Internal,
            },
            Self::Retrieval(err) => match err {
                RetrievalError::DegenerateVector(_) => ErrorKind::DegenerateVector,
                RetrievalError::DimensionMismatch { .. } => ErrorKind::InvalidInput,
            },
            Self::Chat(err) => match err {
                ChatError::EmptyMessage => ErrorKind::InvalidInput,
                ChatError::Backend(_) => ErrorKind::Internal,
            },
            Self::ModelMismatch(_) => ErrorKind::ModelMismatch,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

fn market_data_kind(err: &MarketDataError) -> ErrorKind {
    match err {
        MarketDataError::DataUnavailable(_)
        | MarketDataError::Io(_)
        | MarketDataError::HttpRequest { .. } => ErrorKind::DataUnavailable,
        MarketDataError::Csv(_)
        | MarketDataError::MissingColumn(_)
        | MarketDataError::ParseField { .. }
        | MarketDataError::OutOfOrder { .. }
        | MarketDataError::DuplicateTimestamp { .. }
        | MarketDataError::InvalidPayload(_) => ErrorKind::InvalidData,
        MarketDataError::HttpClientBuild(_) => ErrorKind::Internal,
    }
}

fn feature_kind(err: &FeatureError) -> ErrorKind {
    match err {
        FeatureError::Series(inner) => market_data_kind(inner),
        FeatureError::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
        FeatureError::ContinuityGap { .. } => ErrorKind::InvalidData,
        FeatureError::WrongFeatureSet { .. }
        | FeatureError::SchemaVersionMismatch { .. }
        | FeatureError::SchemaFingerprintMismatch { .. } => ErrorKind::ModelMismatch,
        FeatureError::InvalidConfig(_) | FeatureError::UnknownColumn(_) => ErrorKind::Internal,
    }
}

fn sequence_kind(err: &SequenceError) -> ErrorKind {
    match err {
        SequenceError::InsufficientHistory { .. } | SequenceError::EmptyTable => {
            ErrorKind::InsufficientHistory
        }
        SequenceError::ZeroVariance { .. } => ErrorKind::InvalidData,
        SequenceError::InvalidLength(_) => ErrorKind::Internal,
    }
}
