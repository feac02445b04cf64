//! Reconstruction-error scorer: a window autoencoder over normalised
//! anomaly features.

use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_model_compatible, AnomalyError, AnomalyRecord, AnomalyScorer, ScorerKind, Verdict};
use crate::features::{FeatureSet, FeatureTable};
use crate::nn::{Activation, Mlp};
use crate::sequence::{flatten_windows, table_windows, Normalizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdPolicy {
    /// `mean + k * std` of the errors in the batch being scored.
    PerBatch,
    /// `mean + k * std` of the errors measured right after training.
    Training,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    pub seq_length: usize,
    pub threshold_factor: f64,
    pub threshold_policy: ThresholdPolicy,
    pub hidden_units: usize,
    pub latent_units: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            seq_length: 32,
            threshold_factor: 2.5,
            threshold_policy: ThresholdPolicy::PerBatch,
            hidden_units: 32,
            latent_units: 16,
            epochs: 20,
            batch_size: 32,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionModel {
    network: Mlp,
    pub normalizer: Normalizer,
    pub seq_length: usize,
    pub n_features: usize,
    pub schema_fingerprint: String,
    pub training_error_mean: f64,
    pub training_error_std: f64,
}

impl ReconstructionModel {
    /// Per-window mean squared reconstruction error.
    pub fn window_errors(&self, windows: &Array3<f64>) -> Vec<f64> {
        let flat = flatten_windows(windows);
        let reconstructed = self.network.predict(flat.view());
        (reconstructed - &flat)
            .map_axis(Axis(1), |row| row.mapv(|d| d * d).mean().unwrap_or(0.0))
            .to_vec()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconstructionScorer {
    config: ReconstructionConfig,
}

impl ReconstructionScorer {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    fn validate(&self) -> Result<(), AnomalyError> {
        let cfg = &self.config;
        if cfg.seq_length == 0 || cfg.hidden_units == 0 || cfg.latent_units == 0 {
            return Err(AnomalyError::InvalidConfig(
                "seq_length, hidden_units and latent_units must be > 0".to_string(),
            ));
        }
        if !cfg.threshold_factor.is_finite() || cfg.threshold_factor < 0.0 {
            return Err(AnomalyError::InvalidConfig(
                "threshold_factor must be finite and >= 0".to_string(),
            ));
        }
        if cfg.learning_rate.is_nan() || cfg.learning_rate <= 0.0 {
            return Err(AnomalyError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        Ok(())
    }
}

impl AnomalyScorer for ReconstructionScorer {
    type Model = ReconstructionModel;

    fn kind(&self) -> ScorerKind {
        ScorerKind::Reconstruction
    }

    fn train(&self, features: &FeatureTable) -> Result<ReconstructionModel, AnomalyError> {
        self.validate()?;
        features.require_set(FeatureSet::Anomaly)?;

        let cfg = &self.config;
        let normalizer = Normalizer::fit(features.matrix().view())?;
        let windows = table_windows(features, &normalizer, cfg.seq_length)?;
        let flat = flatten_windows(&windows.windows);
        let width = flat.ncols();

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut network = Mlp::new(
            &[width, cfg.hidden_units, cfg.latent_units, cfg.hidden_units, width],
            Activation::Tanh,
            Activation::Linear,
            &mut rng,
        );

        for epoch in 0..cfg.epochs {
            let loss = network.train_epoch(flat.view(), flat.view(), cfg.batch_size, cfg.learning_rate, &mut rng);
            if !loss.is_finite() {
                return Err(AnomalyError::TrainingDiverged { epoch });
            }
            debug!(
                component = "anomaly",
                event = "anomaly.reconstruction.train.epoch",
                epoch = epoch,
                loss = loss
            );
        }

        let mut model = ReconstructionModel {
            network,
            normalizer,
            seq_length: cfg.seq_length,
            n_features: features.schema.width(),
            schema_fingerprint: features.schema.fingerprint.clone(),
            training_error_mean: 0.0,
            training_error_std: 0.0,
        };
        let (mean, std) = error_stats(&model.window_errors(&windows.windows));
        model.training_error_mean = mean;
        model.training_error_std = std;

        info!(
            component = "anomaly",
            event = "anomaly.reconstruction.train.finish",
            windows = windows.starts.len(),
            seq_length = cfg.seq_length,
            error_mean = mean,
            error_std = std
        );

        Ok(model)
    }

    fn score(
        &self,
        features: &FeatureTable,
        model: &ReconstructionModel,
    ) -> Result<Vec<AnomalyRecord>, AnomalyError> {
        check_model_compatible(features, &model.schema_fingerprint, model.n_features)?;

        let windows = table_windows(features, &model.normalizer, model.seq_length)?;
        let errors = model.window_errors(&windows.windows);
        let k = self.config.threshold_factor;
        let threshold = match self.config.threshold_policy {
            ThresholdPolicy::PerBatch => error_threshold(&errors, k),
            ThresholdPolicy::Training => model.training_error_mean + k * model.training_error_std,
        };

        let records: Vec<AnomalyRecord> = windows
            .starts
            .iter()
            .zip(errors)
            .map(|(&start, error)| AnomalyRecord {
                row: features.rows[start].clone(),
                verdict: Verdict::Reconstruction {
                    error,
                    threshold,
                    anomalous: error > threshold,
                    window_len: model.seq_length,
                },
            })
            .collect();

        info!(
            component = "anomaly",
            event = "anomaly.reconstruction.score.finish",
            windows = records.len(),
            threshold = threshold,
            policy = ?self.config.threshold_policy,
            flagged = records.iter().filter(|r| r.verdict.is_anomalous()).count()
        );

        Ok(records)
    }
}

/// `mean(errors) + k * std(errors)` with the population std.
pub fn error_threshold(errors: &[f64], k: f64) -> f64 {
    let (mean, std) = error_stats(errors);
    mean + k * std
}

fn error_stats(errors: &[f64]) -> (f64, f64) {
    if errors.is_empty() {
        return (0.0, 0.0);
    }
    let (min, max) = errors
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), e| (lo.min(*e), hi.max(*e)));
    // identical errors must not be pushed over their own mean by rounding
    let spread = max - min;
    if spread <= 1e-9 * max.abs() || spread <= f64::EPSILON {
        return (max, 0.0);
    }
    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors
        .iter()
        .map(|e| {
            let d = e - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_mean_plus_k_std() {
        let errors = [1.0, 2.0, 3.0, 4.0];
        let std = 1.25f64.sqrt();
        assert!((error_threshold(&errors, 2.5) - (2.5 + 2.5 * std)).abs() < 1e-12);
    }

    #[test]
    fn identical_errors_never_exceed_threshold() {
        let errors = vec![0.1 + 0.2; 7];
        for k in [0.0, 0.5, 2.5] {
            let threshold = error_threshold(&errors, k);
            assert!(errors.iter().all(|e| *e <= threshold));
        }
    }
}
