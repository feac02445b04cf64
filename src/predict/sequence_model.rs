//! Window-based next-close predictor trained on the normalised ML table.

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_model_compatible, PredictError, PredictorKind, PricePredictor, TARGET_COLUMN};
use crate::features::{FeatureError, FeatureSet, FeatureTable};
use crate::nn::{Activation, Mlp};
use crate::sequence::{flatten_windows, latest_window, table_supervised_windows, Normalizer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePredictorConfig {
    pub seq_length: usize,
    pub hidden_units: usize,
    pub epochs: usize,
    /// Epochs without training-loss improvement before stopping.
    pub patience: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for SequencePredictorConfig {
    fn default() -> Self {
        Self {
            seq_length: 48,
            hidden_units: 64,
            epochs: 50,
            patience: 10,
            batch_size: 32,
            learning_rate: 0.005,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePredictorModel {
    network: Mlp,
    pub normalizer: Normalizer,
    pub seq_length: usize,
    pub n_features: usize,
    pub schema_fingerprint: String,
    pub best_loss: f64,
    pub epochs_run: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SequencePredictor {
    config: SequencePredictorConfig,
}

impl SequencePredictor {
    pub fn new(config: SequencePredictorConfig) -> Self {
        Self { config }
    }
}

impl PricePredictor for SequencePredictor {
    type Model = SequencePredictorModel;

    fn kind(&self) -> PredictorKind {
        PredictorKind::Sequence
    }

    fn train(&self, features: &FeatureTable) -> Result<SequencePredictorModel, PredictError> {
        let cfg = &self.config;
        if cfg.seq_length == 0 || cfg.hidden_units == 0 || cfg.epochs == 0 {
            return Err(PredictError::InvalidConfig(
                "seq_length, hidden_units and epochs must be > 0".to_string(),
            ));
        }
        features.require_set(FeatureSet::Ml)?;
        let close_idx = close_index(features)?;

        let normalizer = Normalizer::fit(features.matrix().view())?;
        let windows = table_supervised_windows(features, &normalizer, cfg.seq_length)?;
        let inputs = flatten_windows(&windows.inputs);
        let targets = windows.targets.column(close_idx).to_owned().insert_axis(Axis(1));

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut network = Mlp::new(
            &[inputs.ncols(), cfg.hidden_units, cfg.hidden_units / 2 + 1, 1],
            Activation::Tanh,
            Activation::Linear,
            &mut rng,
        );

        let mut best = network.clone();
        let mut best_loss = f64::INFINITY;
        let mut stale = 0;
        let mut epochs_run = 0;
        for epoch in 0..cfg.epochs {
            let loss = network.train_epoch(inputs.view(), targets.view(), cfg.batch_size, cfg.learning_rate, &mut rng);
            epochs_run = epoch + 1;
            if !loss.is_finite() {
                return Err(PredictError::TrainingDiverged { epoch });
            }
            debug!(
                component = "predict",
                event = "predict.sequence.train.epoch",
                epoch = epoch,
                loss = loss
            );

            if loss < best_loss {
                best_loss = loss;
                best = network.clone();
                stale = 0;
            } else {
                stale += 1;
                if stale >= cfg.patience {
                    info!(
                        component = "predict",
                        event = "predict.sequence.train.early_stop",
                        epoch = epoch,
                        best_loss = best_loss
                    );
                    break;
                }
            }
        }

        info!(
            component = "predict",
            event = "predict.sequence.train.finish",
            windows = windows.len(),
            seq_length = cfg.seq_length,
            epochs_run = epochs_run,
            best_loss = best_loss
        );

        Ok(SequencePredictorModel {
            network: best,
            normalizer,
            seq_length: cfg.seq_length,
            n_features: features.schema.width(),
            schema_fingerprint: features.schema.fingerprint.clone(),
            best_loss,
            epochs_run,
        })
    }

    /// Normalises the trailing window of the last contiguous segment with the
    /// persisted pair, then denormalises the network output.
    fn predict(&self, features: &FeatureTable, model: &SequencePredictorModel) -> Result<f64, PredictError> {
        check_model_compatible(features, &model.schema_fingerprint, model.n_features)?;

        let last_segment = features.segments().pop().unwrap_or(0..0);
        let raw = features.matrix();
        let segment = raw.slice(ndarray::s![last_segment, ..]);
        let window = latest_window(segment, model.seq_length)?;
        let normalized = model.normalizer.normalize(window.view());
        let input = normalized
            .into_shape_with_order((1, model.seq_length * model.n_features))
            .map_err(|err| PredictError::ModelMismatch(err.to_string()))?;

        let output = model.network.predict(input.view());
        Ok(model.normalizer.denormalize_value(output[[0, 0]]))
    }
}

fn close_index(features: &FeatureTable) -> Result<usize, PredictError> {
    features
        .schema
        .column_index(TARGET_COLUMN)
        .ok_or_else(|| FeatureError::UnknownColumn(TARGET_COLUMN.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_features, FeatureConfig};
    use crate::market_data::PriceRecord;

    fn ml_table(n: usize) -> FeatureTable {
        let records: Vec<PriceRecord> = (0..n)
            .map(|i| {
                let close = 100.0 + 3.0 * (i as f64 * 0.2).sin();
                PriceRecord {
                    open_time_ms: 1_735_689_600_000 + i as i64 * 3_600_000,
                    open_price: close - 0.4,
                    high_price: close + 1.0,
                    low_price: close - 1.0,
                    close_price: close,
                    volume: 10.0 + (i % 5) as f64,
                }
            })
            .collect();
        build_features(&records, FeatureSet::Ml, &FeatureConfig::default())
            .unwrap()
            .0
    }

    #[test]
    fn forecast_is_denormalized_network_output_on_trailing_window() {
        let table = ml_table(120);
        let predictor = SequencePredictor::new(SequencePredictorConfig {
            seq_length: 8,
            hidden_units: 8,
            epochs: 3,
            ..SequencePredictorConfig::default()
        });
        let model = predictor.train(&table).unwrap();

        let raw = table.matrix();
        let trailing = latest_window(raw.view(), model.seq_length).unwrap();
        let input = model
            .normalizer
            .normalize(trailing.view())
            .into_shape_with_order((1, model.seq_length * model.n_features))
            .unwrap();
        let network_out = model.network.predict(input.view())[[0, 0]];
        let expected = model.normalizer.denormalize_value(network_out);

        let forecast = predictor.predict(&table, &model).unwrap();
        assert!((forecast - expected).abs() < 1e-9);
        assert!((forecast - network_out).abs() > 1.0);
    }
}
