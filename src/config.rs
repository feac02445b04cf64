//! Pipeline configuration assembled from defaults and `CMI_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::anomaly::{IsolationForestConfig, ReconstructionConfig, ThresholdPolicy, DEFAULT_ZSCORE_THRESHOLD};
use crate::features::{FeatureConfig, GapPolicy};
use crate::market_data::{parse_interval, KlineFetchRequest, MarketDataConfig};
use crate::observability::parse_bool;
use crate::predict::{BoostedTreesConfig, RandomForestConfig, SequencePredictorConfig};
use crate::retrieval::{DEFAULT_EMBEDDING_DIM, DEFAULT_TOP_K};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    Binance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub source: SourceKind,
    pub prices_csv: PathBuf,
    pub fetch: KlineFetchRequest,
    pub market_data: MarketDataConfig,
    pub model_store_path: PathBuf,
    pub embedding_store_path: PathBuf,
    pub features: FeatureConfig,
    pub density: IsolationForestConfig,
    pub reconstruction: ReconstructionConfig,
    pub random_forest: RandomForestConfig,
    pub boosted_trees: BoostedTreesConfig,
    pub sequence: SequencePredictorConfig,
    pub zscore_threshold: f64,
    pub top_k: usize,
    pub embedding_dim: usize,
    /// Whether to score each anomaly model once right after training it.
    pub score_after_training: bool,
    pub server_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Csv,
            prices_csv: PathBuf::from("data/processed/prices_cleaned.csv"),
            fetch: KlineFetchRequest::default(),
            market_data: MarketDataConfig::default(),
            model_store_path: PathBuf::from("data/models.sqlite"),
            embedding_store_path: PathBuf::from("data/embeddings.sqlite"),
            features: FeatureConfig::default(),
            density: IsolationForestConfig::default(),
            reconstruction: ReconstructionConfig::default(),
            random_forest: RandomForestConfig::default(),
            boosted_trees: BoostedTreesConfig::default(),
            sequence: SequencePredictorConfig::default(),
            zscore_threshold: DEFAULT_ZSCORE_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            score_after_training: false,
            server_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Missing or unparsable variables keep their default.
pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(source) = env_string("CMI_DATA_SOURCE").and_then(|raw| parse_source(&raw)) {
        config.source = source;
    }
    if let Some(path) = env_string("CMI_PRICES_CSV") {
        config.prices_csv = PathBuf::from(path);
    }
    if let Some(symbol) = env_string("CMI_SYMBOL") {
        config.fetch.symbol = symbol.to_ascii_uppercase();
    }
    if let Some(interval) = env_string("CMI_INTERVAL").and_then(|raw| parse_interval(&raw)) {
        config.fetch.interval = interval;
    }
    config.features.interval_ms = Some(config.fetch.interval.step_ms());
    if let Some(limit) = env_parse::<u32>("CMI_FETCH_LIMIT").filter(|v| (1..=1_000).contains(v)) {
        config.fetch.limit = limit;
    }
    if let Some(timeout) = env_parse::<u64>("CMI_HTTP_TIMEOUT_MS").filter(|v| *v > 0) {
        config.market_data.http_timeout_ms = timeout;
    }
    if let Some(path) = env_string("CMI_MODEL_STORE") {
        config.model_store_path = PathBuf::from(path);
    }
    if let Some(path) = env_string("CMI_EMBEDDING_STORE") {
        config.embedding_store_path = PathBuf::from(path);
    }
    if let Some(policy) = env_string("CMI_GAP_POLICY").and_then(|raw| parse_gap_policy(&raw)) {
        config.features.gap_policy = policy;
    }
    if let Some(contamination) =
        env_parse::<f64>("CMI_CONTAMINATION").filter(|v| *v > 0.0 && *v <= 0.5)
    {
        config.density.contamination = contamination;
    }
    if let Some(factor) =
        env_parse::<f64>("CMI_THRESHOLD_FACTOR").filter(|v| v.is_finite() && *v >= 0.0)
    {
        config.reconstruction.threshold_factor = factor;
    }
    if let Some(policy) =
        env_string("CMI_THRESHOLD_POLICY").and_then(|raw| parse_threshold_policy(&raw))
    {
        config.reconstruction.threshold_policy = policy;
    }
    if let Some(top_k) = env_parse::<usize>("CMI_TOP_K").filter(|v| *v > 0) {
        config.top_k = top_k;
    }
    if let Some(flag) = env_string("CMI_SCORE_AFTER_TRAINING").and_then(|raw| parse_bool(&raw)) {
        config.score_after_training = flag;
    }
    if let Some(addr) = env_string("CMI_SERVER_ADDR") {
        config.server_addr = addr;
    }

    config
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key)?.parse().ok()
}

fn parse_source(raw: &str) -> Option<SourceKind> {
    match raw.to_ascii_lowercase().as_str() {
        "csv" => Some(SourceKind::Csv),
        "binance" => Some(SourceKind::Binance),
        _ => None,
    }
}

fn parse_gap_policy(raw: &str) -> Option<GapPolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => Some(GapPolicy::Strict),
        "skip" | "report_and_skip" => Some(GapPolicy::ReportAndSkip),
        _ => None,
    }
}

fn parse_threshold_policy(raw: &str) -> Option<ThresholdPolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "per_batch" | "batch" => Some(ThresholdPolicy::PerBatch),
        "training" | "persisted" => Some(ThresholdPolicy::Training),
        _ => None,
    }
}
