//! Squared-error gradient boosting with row and column subsampling.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tree::{RegressionTree, TreeConfig};
use super::{check_model_compatible, next_close_dataset, PredictError, PredictorKind, PricePredictor};
use crate::features::FeatureTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTreesConfig {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    /// Fraction of rows drawn for each round.
    pub subsample: f64,
    /// Fraction of columns drawn for each round.
    pub colsample: f64,
    pub seed: u64,
}

impl Default for BoostedTreesConfig {
    fn default() -> Self {
        Self {
            n_rounds: 300,
            learning_rate: 0.05,
            max_depth: 6,
            subsample: 0.8,
            colsample: 0.8,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTreesModel {
    base: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
    pub n_features: usize,
    pub schema_fingerprint: String,
}

#[derive(Debug, Clone, Default)]
pub struct BoostedTreesPredictor {
    config: BoostedTreesConfig,
}

impl BoostedTreesPredictor {
    pub fn new(config: BoostedTreesConfig) -> Self {
        Self { config }
    }

    fn validate(&self) -> Result<(), PredictError> {
        let cfg = &self.config;
        if cfg.n_rounds == 0 || cfg.max_depth == 0 {
            return Err(PredictError::InvalidConfig(
                "n_rounds and max_depth must be > 0".to_string(),
            ));
        }
        for (name, value) in [("subsample", cfg.subsample), ("colsample", cfg.colsample)] {
            if value.is_nan() || value <= 0.0 || value > 1.0 {
                return Err(PredictError::InvalidConfig(format!("{name} must be in (0, 1]")));
            }
        }
        if cfg.learning_rate.is_nan() || cfg.learning_rate <= 0.0 {
            return Err(PredictError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        Ok(())
    }
}

impl PricePredictor for BoostedTreesPredictor {
    type Model = BoostedTreesModel;

    fn kind(&self) -> PredictorKind {
        PredictorKind::BoostedTrees
    }

    fn train(&self, features: &FeatureTable) -> Result<BoostedTreesModel, PredictError> {
        self.validate()?;
        let cfg = &self.config;
        let dataset = next_close_dataset(features)?;
        let n_rows = dataset.targets.len();
        let n_cols = dataset.inputs.ncols();
        let row_take = ((n_rows as f64 * cfg.subsample).round() as usize).clamp(1, n_rows);
        let col_take = ((n_cols as f64 * cfg.colsample).round() as usize).clamp(1, n_cols);
        let tree_config = TreeConfig {
            max_depth: cfg.max_depth,
            ..TreeConfig::default()
        };

        let base = dataset.targets.iter().sum::<f64>() / n_rows as f64;
        let mut fitted = vec![base; n_rows];
        let mut residuals = vec![0.0; n_rows];
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut trees = Vec::with_capacity(cfg.n_rounds);

        for round in 0..cfg.n_rounds {
            for i in 0..n_rows {
                residuals[i] = dataset.targets[i] - fitted[i];
            }
            let rows = sample(&mut rng, n_rows, row_take).into_vec();
            let mut columns = sample(&mut rng, n_cols, col_take).into_vec();
            columns.sort_unstable();

            let tree = RegressionTree::fit(
                dataset.inputs.view(),
                &residuals,
                rows,
                &columns,
                &tree_config,
                &mut rng,
            );
            for (i, row) in dataset.inputs.rows().into_iter().enumerate() {
                fitted[i] += cfg.learning_rate * tree.predict(row);
            }
            trees.push(tree);

            if round % 50 == 0 {
                let mse = residuals.iter().map(|r| r * r).sum::<f64>() / n_rows as f64;
                if !mse.is_finite() {
                    return Err(PredictError::TrainingDiverged { epoch: round });
                }
                debug!(
                    component = "predict",
                    event = "predict.boosted_trees.train.round",
                    round = round,
                    mse = mse
                );
            }
        }

        info!(
            component = "predict",
            event = "predict.boosted_trees.train.finish",
            rows = n_rows,
            rounds = cfg.n_rounds,
            learning_rate = cfg.learning_rate
        );

        Ok(BoostedTreesModel {
            base,
            learning_rate: cfg.learning_rate,
            trees,
            n_features: features.schema.width(),
            schema_fingerprint: features.schema.fingerprint.clone(),
        })
    }

    fn predict(&self, features: &FeatureTable, model: &BoostedTreesModel) -> Result<f64, PredictError> {
        check_model_compatible(features, &model.schema_fingerprint, model.n_features)?;
        if features.is_empty() {
            return Err(PredictError::InsufficientHistory {
                required: 1,
                available: 0,
            });
        }

        let matrix = features.matrix();
        let latest = matrix.row(matrix.nrows() - 1);
        Ok(model.base
            + model.learning_rate
                * model
                    .trees
                    .iter()
                    .map(|tree| tree.predict(latest))
                    .sum::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsample_outside_unit_interval_is_rejected() {
        let predictor = BoostedTreesPredictor::new(BoostedTreesConfig {
            subsample: 1.5,
            ..BoostedTreesConfig::default()
        });
        assert!(matches!(predictor.validate(), Err(PredictError::InvalidConfig(_))));
    }
}
