use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::tree::{RegressionTree, TreeConfig};
use super::{check_model_compatible, next_close_dataset, PredictError, PredictorKind, PricePredictor};
use crate::features::FeatureTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestConfig {
    pub n_estimators: usize,
    pub tree: TreeConfig,
    pub seed: u64,
}

impl Default for RandomForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            tree: TreeConfig::default(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestModel {
    trees: Vec<RegressionTree>,
    pub n_features: usize,
    pub schema_fingerprint: String,
}

/// Bagged regression trees; each tree sees a bootstrap resample of the rows.
#[derive(Debug, Clone, Default)]
pub struct RandomForestPredictor {
    config: RandomForestConfig,
}

impl RandomForestPredictor {
    pub fn new(config: RandomForestConfig) -> Self {
        Self { config }
    }
}

impl PricePredictor for RandomForestPredictor {
    type Model = RandomForestModel;

    fn kind(&self) -> PredictorKind {
        PredictorKind::RandomForest
    }

    fn train(&self, features: &FeatureTable) -> Result<RandomForestModel, PredictError> {
        if self.config.n_estimators == 0 {
            return Err(PredictError::InvalidConfig("n_estimators must be > 0".to_string()));
        }
        let dataset = next_close_dataset(features)?;
        let n_rows = dataset.targets.len();
        let all_features: Vec<usize> = (0..dataset.inputs.ncols()).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let trees = (0..self.config.n_estimators)
            .map(|_| {
                let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
                RegressionTree::fit(
                    dataset.inputs.view(),
                    &dataset.targets,
                    rows,
                    &all_features,
                    &self.config.tree,
                    &mut rng,
                )
            })
            .collect();

        info!(
            component = "predict",
            event = "predict.random_forest.train.finish",
            rows = n_rows,
            trees = self.config.n_estimators
        );

        Ok(RandomForestModel {
            trees,
            n_features: features.schema.width(),
            schema_fingerprint: features.schema.fingerprint.clone(),
        })
    }

    fn predict(&self, features: &FeatureTable, model: &RandomForestModel) -> Result<f64, PredictError> {
        check_model_compatible(features, &model.schema_fingerprint, model.n_features)?;
        if features.is_empty() || model.trees.is_empty() {
            return Err(PredictError::InsufficientHistory {
                required: 1,
                available: features.len(),
            });
        }

        let matrix = features.matrix();
        let latest = matrix.row(matrix.nrows() - 1);
        let total: f64 = model.trees.iter().map(|tree| tree.predict(latest)).sum();
        Ok(total / model.trees.len() as f64)
    }
}
