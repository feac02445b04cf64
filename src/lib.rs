//! Crypto market intelligence core.
//!
//! Current implemented scope:
//! - price ingestion from CSV or Binance klines, with ETL to a cleaned CSV
//! - feature engineering, sequence windowing and normalisation
//! - anomaly scoring (isolation forest, reconstruction error, z-score)
//! - next-close predictors (random forest, boosted trees, sequence network)
//! - SQLite model and embedding stores, similarity retrieval and chat context
//! - axum HTTP surface over a shared pipeline context

mod anomaly;
mod api;
mod chat;
mod config;
mod context;
mod error;
mod features;
mod market_data;
mod nn;
mod observability;
mod predict;
mod retrieval;
mod sequence;
mod store;
#[cfg(test)]
mod test_support;

pub use anomaly::{
    error_threshold, flagged, zscore_anomalies, AnomalyError, AnomalyRecord, AnomalyScorer,
    DensityModel, DensityScorer, IsolationForestConfig, ReconstructionConfig,
    ReconstructionModel, ReconstructionScorer, ScorerKind, ThresholdPolicy, Verdict,
    ZScoreAnomaly, DEFAULT_ZSCORE_THRESHOLD,
};
pub use api::{
    api_router, status_for, AnomalyResponse, ContextResponse, ErrorBody, IngestResponse,
    PredictionResponse, SharedContext, ZScoreResponse,
};
pub use chat::{
    build_chat_context, AnomalyCount, ChatError, ChatLlm, ChatReply, MarketSummary,
    TemplateResponder, SYSTEM_PROMPT,
};
pub use config::{pipeline_config_from_env, PipelineConfig, SourceKind};
pub use context::{PipelineContext, TrainingSummary};
pub use error::{ErrorKind, PipelineError};
pub use features::{
    assert_schema_compatible, build_feature_schema, build_features, pct_change, rolling_mean,
    rolling_std, FeatureBuildReport, FeatureColumn, FeatureConfig, FeatureError, FeatureRow,
    FeatureSchema, FeatureSet, FeatureTable, GapPolicy, FEATURE_SCHEMA_VERSION,
};
pub use market_data::{
    fetch_binance_klines, parse_interval, parse_price_csv, read_price_csv, run_etl,
    validate_price_series, write_price_csv, BinancePriceSource, CsvPriceSource,
    InMemoryPriceSource, KlineFetchRequest, KlineInterval, MarketDataConfig, MarketDataError,
    PriceRecord, PriceSource, PRICE_CSV_HEADERS,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_source_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use predict::{
    next_close_dataset, BoostedTreesConfig, BoostedTreesModel, BoostedTreesPredictor,
    NextCloseDataset, PredictError, PredictorKind, PricePredictor, RandomForestConfig,
    RandomForestModel, RandomForestPredictor, SequencePredictor, SequencePredictorConfig,
    SequencePredictorModel,
};
pub use retrieval::{
    cosine_similarity, top_k_similar, Embedder, HashingEmbedder, RetrievalError, ScoredRecord,
    DEFAULT_EMBEDDING_DIM, DEFAULT_TOP_K,
};
pub use sequence::{
    build_supervised_windows, build_windows, flatten_windows, latest_window,
    table_supervised_windows, table_windows, Normalizer, SequenceError, SupervisedWindows,
    TableWindows,
};
pub use store::{EmbeddingRecord, EmbeddingStore, ModelEntry, ModelStore, StoreError, StoredModel};
