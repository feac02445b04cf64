//! The pipeline context: built once at process start, owns the price source,
//! both stores and the chat collaborators, and exposes the operations the
//! HTTP layer and the binaries call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anomaly::{
    zscore_anomalies, AnomalyRecord, AnomalyScorer, DensityScorer, ReconstructionScorer, ScorerKind,
    ZScoreAnomaly,
};
use crate::chat::{build_chat_context, AnomalyCount, ChatLlm, ChatReply, MarketSummary, TemplateResponder};
use crate::config::{PipelineConfig, SourceKind};
use crate::error::{ErrorKind, PipelineError};
use crate::features::{build_feature_schema, build_features, FeatureSet, FeatureTable};
use crate::market_data::{BinancePriceSource, CsvPriceSource, PriceRecord, PriceSource};
use crate::predict::{
    BoostedTreesPredictor, PredictorKind, PricePredictor, RandomForestPredictor, SequencePredictor,
};
use crate::retrieval::{top_k_similar, Embedder, HashingEmbedder, ScoredRecord};
use crate::store::{EmbeddingRecord, EmbeddingStore, ModelEntry, ModelStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub model_name: String,
    pub kind: String,
    pub feature_set: FeatureSet,
    pub rows: usize,
    pub schema_fingerprint: String,
}

pub struct PipelineContext {
    config: PipelineConfig,
    source: Box<dyn PriceSource>,
    models: ModelStore,
    embeddings: EmbeddingStore,
    embedder: Box<dyn Embedder>,
    llm: Box<dyn ChatLlm>,
}

impl PipelineContext {
    /// Opens the on-disk stores and the configured price source.
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let source: Box<dyn PriceSource> = match config.source {
            SourceKind::Csv => Box::new(CsvPriceSource::new(config.prices_csv.clone())),
            SourceKind::Binance => Box::new(BinancePriceSource::new(
                config.fetch.clone(),
                config.market_data.clone(),
            )),
        };
        let models = ModelStore::open(&config.model_store_path)?;
        let embeddings = EmbeddingStore::open(&config.embedding_store_path)?;
        Ok(Self::new(config, source, models, embeddings))
    }

    pub fn new(
        config: PipelineConfig,
        source: Box<dyn PriceSource>,
        models: ModelStore,
        embeddings: EmbeddingStore,
    ) -> Self {
        let embedder = Box::new(HashingEmbedder::new(config.embedding_dim));
        info!(
            component = "context",
            event = "context.open",
            source = %source.describe(),
            model_store = %config.model_store_path.display(),
            embedding_store = %config.embedding_store_path.display()
        );
        Self {
            config,
            source,
            models,
            embeddings,
            embedder,
            llm: Box::new(TemplateResponder),
        }
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_llm(mut self, llm: Box<dyn ChatLlm>) -> Self {
        self.llm = llm;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown(self) {
        info!(component = "context", event = "context.shutdown");
    }

    pub fn load_prices(&self) -> Result<Vec<PriceRecord>, PipelineError> {
        Ok(self.source.load()?)
    }

    pub fn features(&self, set: FeatureSet) -> Result<FeatureTable, PipelineError> {
        let records = self.load_prices()?;
        self.features_from(&records, set)
    }

    fn features_from(&self, records: &[PriceRecord], set: FeatureSet) -> Result<FeatureTable, PipelineError> {
        let (table, report) = build_features(records, set, &self.config.features)?;
        if !report.gap_ranges.is_empty() {
            warn!(
                component = "context",
                event = "context.features.gaps",
                feature_set = set.as_str(),
                gaps = report.gap_ranges.len(),
                segments = report.segments
            );
        }
        Ok(table)
    }

    pub fn list_models(&self) -> Result<Vec<ModelEntry>, PipelineError> {
        Ok(self.models.list()?)
    }

    pub fn train_anomaly_model(&self, kind: ScorerKind) -> Result<TrainingSummary, PipelineError> {
        let features = self.features(FeatureSet::Anomaly)?;
        let summary = match kind {
            ScorerKind::Density => self.train_scorer(&self.density_scorer(), &features)?,
            ScorerKind::Reconstruction => self.train_scorer(&self.reconstruction_scorer(), &features)?,
        };

        if self.config.score_after_training {
            let flagged = self
                .score_anomalies(kind)?
                .iter()
                .filter(|r| r.verdict.is_anomalous())
                .count();
            info!(
                component = "context",
                event = "context.anomaly.post_train_score",
                scorer = kind.as_str(),
                flagged = flagged
            );
        }
        Ok(summary)
    }

    /// Trains every anomaly scorer on one shared feature table.
    pub fn train_anomaly_models(&self) -> Result<Vec<TrainingSummary>, PipelineError> {
        let features = self.features(FeatureSet::Anomaly)?;
        Ok(vec![
            self.train_scorer(&self.density_scorer(), &features)?,
            self.train_scorer(&self.reconstruction_scorer(), &features)?,
        ])
    }

    pub fn score_anomalies(&self, kind: ScorerKind) -> Result<Vec<AnomalyRecord>, PipelineError> {
        let features = self.features(FeatureSet::Anomaly)?;
        self.score_table(kind, &features)
    }

    pub fn zscore_anomalies(&self, column: &str) -> Result<Vec<ZScoreAnomaly>, PipelineError> {
        let features = self.features(FeatureSet::Anomaly)?;
        if features.schema.column_index(column).is_none() {
            return Err(PipelineError::InvalidInput(format!(
                "unknown anomaly feature column: {column}"
            )));
        }
        Ok(zscore_anomalies(&features, column, self.config.zscore_threshold)?)
    }

    pub fn train_predictor(&self, kind: PredictorKind) -> Result<TrainingSummary, PipelineError> {
        let features = self.features(FeatureSet::Ml)?;
        match kind {
            PredictorKind::RandomForest => self.train_with(
                &RandomForestPredictor::new(self.config.random_forest.clone()),
                &features,
            ),
            PredictorKind::BoostedTrees => self.train_with(
                &BoostedTreesPredictor::new(self.config.boosted_trees.clone()),
                &features,
            ),
            PredictorKind::Sequence => self.train_with(
                &SequencePredictor::new(self.config.sequence.clone()),
                &features,
            ),
        }
    }

    pub fn predict_price(&self, kind: PredictorKind) -> Result<f64, PipelineError> {
        let features = self.features(FeatureSet::Ml)?;
        self.predict_table(kind, &features)
    }

    pub fn retrieve_context(&self, query: &str, k: Option<usize>) -> Result<Vec<ScoredRecord>, PipelineError> {
        let query_vector = self.embedder.embed(query)?;
        let corpus = self.embeddings.load_all()?;
        let k = k.unwrap_or(self.config.top_k);
        Ok(top_k_similar(&query_vector, &corpus, k)?)
    }

    pub fn ingest_context(
        &self,
        text: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<i64, PipelineError> {
        if text.trim().is_empty() {
            return Err(PipelineError::InvalidInput("context text is empty".to_string()));
        }
        let embedding = self.embedder.embed(text)?;
        Ok(self.embeddings.save(&EmbeddingRecord {
            text: text.to_string(),
            metadata,
            embedding,
        })?)
    }

    /// Signals from whichever models are currently trained.
    pub fn market_summary(&self) -> Result<MarketSummary, PipelineError> {
        let records = self.load_prices()?;
        let mut summary = MarketSummary {
            latest_close: records.last().map(|r| r.close_price),
            ..MarketSummary::default()
        };

        if let Some(features) = optional_signal(self.features_from(&records, FeatureSet::Ml))? {
            for kind in PredictorKind::ALL {
                if let Some(value) = optional_signal(self.predict_table(kind, &features))? {
                    summary.predictions.insert(kind.as_str().to_string(), value);
                }
            }
        }
        if let Some(features) = optional_signal(self.features_from(&records, FeatureSet::Anomaly))? {
            for kind in ScorerKind::ALL {
                if let Some(scored) = optional_signal(self.score_table(kind, &features))? {
                    let count = AnomalyCount {
                        flagged: scored.iter().filter(|r| r.verdict.is_anomalous()).count(),
                        scored: scored.len(),
                    };
                    summary.anomalies.insert(kind.as_str().to_string(), count);
                }
            }
        }
        Ok(summary)
    }

    pub fn chat(&self, message: &str) -> Result<ChatReply, PipelineError> {
        if message.trim().is_empty() {
            return Err(PipelineError::InvalidInput("chat message is empty".to_string()));
        }

        let summary = self.market_summary()?;
        let sources = if self.embeddings.is_empty()? {
            Vec::new()
        } else {
            self.retrieve_context(message, None)?
        };
        let context = build_chat_context(&summary, &sources);
        let reply = self.llm.complete(&context, message)?;

        info!(
            component = "context",
            event = "context.chat.finish",
            sources = sources.len(),
            predictions = summary.predictions.len(),
            context_len = context.len()
        );
        Ok(ChatReply {
            reply,
            context,
            sources,
        })
    }

    fn score_table(&self, kind: ScorerKind, features: &FeatureTable) -> Result<Vec<AnomalyRecord>, PipelineError> {
        match kind {
            ScorerKind::Density => self.score_with(&self.density_scorer(), features),
            ScorerKind::Reconstruction => self.score_with(&self.reconstruction_scorer(), features),
        }
    }

    fn predict_table(&self, kind: PredictorKind, features: &FeatureTable) -> Result<f64, PipelineError> {
        let value = match kind {
            PredictorKind::RandomForest => self.predict_with(
                &RandomForestPredictor::new(self.config.random_forest.clone()),
                features,
            )?,
            PredictorKind::BoostedTrees => self.predict_with(
                &BoostedTreesPredictor::new(self.config.boosted_trees.clone()),
                features,
            )?,
            PredictorKind::Sequence => self.predict_with(
                &SequencePredictor::new(self.config.sequence.clone()),
                features,
            )?,
        };

        info!(
            component = "context",
            event = "context.predict.finish",
            predictor = kind.as_str(),
            value = value
        );
        Ok(value)
    }

    fn density_scorer(&self) -> DensityScorer {
        DensityScorer::new(self.config.density.clone())
    }

    fn reconstruction_scorer(&self) -> ReconstructionScorer {
        ReconstructionScorer::new(self.config.reconstruction.clone())
    }

    fn train_scorer<S: AnomalyScorer>(
        &self,
        scorer: &S,
        features: &FeatureTable,
    ) -> Result<TrainingSummary, PipelineError> {
        let kind = scorer.kind();
        let model = scorer.train(features)?;
        self.save_model(kind.model_name(), kind.as_str(), features, &model)
    }

    fn score_with<S: AnomalyScorer>(
        &self,
        scorer: &S,
        features: &FeatureTable,
    ) -> Result<Vec<AnomalyRecord>, PipelineError> {
        let name = scorer.kind().model_name();
        let stored = self.models.load::<S::Model>(name)?;
        ensure_current_schema(name, &stored.schema_fingerprint, FeatureSet::Anomaly)?;
        Ok(scorer.score(features, &stored.model)?)
    }

    fn train_with<P: PricePredictor>(
        &self,
        predictor: &P,
        features: &FeatureTable,
    ) -> Result<TrainingSummary, PipelineError> {
        let kind = predictor.kind();
        let model = predictor.train(features)?;
        self.save_model(kind.model_name(), kind.as_str(), features, &model)
    }

    fn predict_with<P: PricePredictor>(&self, predictor: &P, features: &FeatureTable) -> Result<f64, PipelineError> {
        let name = predictor.kind().model_name();
        let stored = self.models.load::<P::Model>(name)?;
        ensure_current_schema(name, &stored.schema_fingerprint, FeatureSet::Ml)?;
        Ok(predictor.predict(features, &stored.model)?)
    }

    fn save_model<M: Serialize>(
        &self,
        name: &str,
        kind: &str,
        features: &FeatureTable,
        model: &M,
    ) -> Result<TrainingSummary, PipelineError> {
        self.models
            .save(name, kind, &features.schema.fingerprint, model)?;
        info!(
            component = "context",
            event = "context.train.finish",
            model = name,
            rows = features.len()
        );
        Ok(TrainingSummary {
            model_name: name.to_string(),
            kind: kind.to_string(),
            feature_set: features.feature_set(),
            rows: features.len(),
            schema_fingerprint: features.schema.fingerprint.clone(),
        })
    }
}

/// Missing models and short histories leave a signal out of the summary.
fn optional_signal<T>(result: Result<T, PipelineError>) -> Result<Option<T>, PipelineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if matches!(err.kind(), ErrorKind::ModelNotFound | ErrorKind::InsufficientHistory) => Ok(None),
        Err(err) => Err(err),
    }
}

fn ensure_current_schema(name: &str, stored_fingerprint: &str, set: FeatureSet) -> Result<(), PipelineError> {
    let current = build_feature_schema(set);
    if current.fingerprint != stored_fingerprint {
        return Err(PipelineError::ModelMismatch(format!(
            "model {name} was trained on schema {stored_fingerprint}, current {} schema is {}",
            set.as_str(),
            current.fingerprint
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::IsolationForestConfig;
    use crate::market_data::InMemoryPriceSource;

    fn context(rows: usize) -> PipelineContext {
        let records = (0..rows)
            .map(|i| {
                let close = 250.0 + (i as f64 * 0.35).sin() * 6.0;
                PriceRecord {
                    open_time_ms: 1_735_689_600_000 + i as i64 * 3_600_000,
                    open_price: close,
                    high_price: close + 1.5,
                    low_price: close - 1.5,
                    close_price: close,
                    volume: 40.0,
                }
            })
            .collect();
        let config = PipelineConfig {
            density: IsolationForestConfig {
                n_estimators: 10,
                ..IsolationForestConfig::default()
            },
            ..PipelineConfig::default()
        };
        PipelineContext::new(
            config,
            Box::new(InMemoryPriceSource::new(records)),
            ModelStore::open_in_memory().unwrap(),
            EmbeddingStore::open_in_memory().unwrap(),
        )
    }

    #[test]
    fn stale_schema_fingerprint_is_a_model_mismatch() {
        let ctx = context(120);
        let summary = ctx.train_anomaly_model(ScorerKind::Density).unwrap();
        assert_eq!(summary.feature_set, FeatureSet::Anomaly);

        let stored = ctx.models.load::<crate::anomaly::DensityModel>("anomaly_density").unwrap();
        ctx.models
            .save("anomaly_density", "density", "stale", &stored.model)
            .unwrap();

        let err = ctx.score_anomalies(ScorerKind::Density).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelMismatch);
    }

    #[test]
    fn summary_skips_untrained_signals() {
        let ctx = context(60);
        ctx.train_predictor(PredictorKind::RandomForest).unwrap();

        let summary = ctx.market_summary().unwrap();
        assert_eq!(summary.predictions.len(), 1);
        assert!(summary.predictions.contains_key("random_forest"));
        assert!(summary.anomalies.is_empty());
        assert!(summary.latest_close.is_some());
    }

    #[test]
    fn ingest_rejects_blank_text() {
        let ctx = context(30);
        let err = ctx.ingest_context("   ", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let id = ctx.ingest_context("Open interest climbs", BTreeMap::new()).unwrap();
        assert_eq!(ctx.retrieve_context("open interest", Some(5)).unwrap().len(), 1);
        assert!(id > 0);
    }
}
