//! Density-based scorer backed by an isolation forest.

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{check_model_compatible, AnomalyError, AnomalyRecord, AnomalyScorer, ScorerKind, Verdict};
use crate::features::{FeatureSet, FeatureTable};

const EULER_GAMMA: f64 = 0.577_215_664_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForestConfig {
    pub n_estimators: usize,
    /// Fraction of the training population expected to be anomalous.
    pub contamination: f64,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 300,
            contamination: 0.02,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IsolationNode {
    Split {
        feature: usize,
        value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

impl IsolationNode {
    fn path_length(&self, sample: ArrayView1<'_, f64>, depth: usize) -> f64 {
        match self {
            Self::Leaf { size } => depth as f64 + average_path_length(*size),
            Self::Split {
                feature,
                value,
                left,
                right,
            } => {
                if sample[*feature] < *value {
                    left.path_length(sample, depth + 1)
                } else {
                    right.path_length(sample, depth + 1)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityModel {
    trees: Vec<IsolationNode>,
    sample_size: usize,
    pub threshold: f64,
    pub contamination: f64,
    pub n_features: usize,
    pub schema_fingerprint: String,
}

impl DensityModel {
    /// `2^(-E[h(x)] / c(sample_size))`, in `(0, 1]`; higher is more isolated.
    pub fn anomaly_score(&self, sample: ArrayView1<'_, f64>) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let mean_path = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let normaliser = average_path_length(self.sample_size);
        if normaliser <= f64::EPSILON {
            return 0.5;
        }
        2f64.powf(-mean_path / normaliser)
    }

    fn scores(&self, data: &Array2<f64>) -> Vec<f64> {
        data.rows().into_iter().map(|row| self.anomaly_score(row)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DensityScorer {
    config: IsolationForestConfig,
}

impl DensityScorer {
    pub fn new(config: IsolationForestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IsolationForestConfig {
        &self.config
    }

    fn validate(&self) -> Result<(), AnomalyError> {
        let cfg = &self.config;
        if cfg.n_estimators == 0 {
            return Err(AnomalyError::InvalidConfig("n_estimators must be > 0".to_string()));
        }
        if cfg.contamination.is_nan() || cfg.contamination <= 0.0 || cfg.contamination > 0.5 {
            return Err(AnomalyError::InvalidConfig(
                "contamination must be in (0, 0.5]".to_string(),
            ));
        }
        if cfg.max_samples < 2 {
            return Err(AnomalyError::InvalidConfig("max_samples must be >= 2".to_string()));
        }
        Ok(())
    }
}

impl AnomalyScorer for DensityScorer {
    type Model = DensityModel;

    fn kind(&self) -> ScorerKind {
        ScorerKind::Density
    }

    fn train(&self, features: &FeatureTable) -> Result<DensityModel, AnomalyError> {
        self.validate()?;
        features.require_set(FeatureSet::Anomaly)?;
        if features.len() < 2 {
            return Err(AnomalyError::InsufficientHistory {
                required: 2,
                available: features.len(),
            });
        }

        let data = features.matrix();
        let sample_size = self.config.max_samples.min(data.nrows());
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let trees = (0..self.config.n_estimators)
            .map(|_| {
                let indices = sample(&mut rng, data.nrows(), sample_size).into_vec();
                build_node(&data, indices, 0, max_depth, &mut rng)
            })
            .collect();

        let mut model = DensityModel {
            trees,
            sample_size,
            threshold: 0.0,
            contamination: self.config.contamination,
            n_features: data.ncols(),
            schema_fingerprint: features.schema.fingerprint.clone(),
        };

        let mut scores = model.scores(&data);
        scores.sort_by(|a, b| a.total_cmp(b));
        model.threshold = linear_quantile(&scores, 1.0 - self.config.contamination);

        info!(
            component = "anomaly",
            event = "anomaly.density.train.finish",
            rows = data.nrows(),
            trees = self.config.n_estimators,
            sample_size = sample_size,
            threshold = model.threshold
        );

        Ok(model)
    }

    fn score(&self, features: &FeatureTable, model: &DensityModel) -> Result<Vec<AnomalyRecord>, AnomalyError> {
        check_model_compatible(features, &model.schema_fingerprint, model.n_features)?;

        let data = features.matrix();
        let records: Vec<AnomalyRecord> = model
            .scores(&data)
            .into_iter()
            .zip(&features.rows)
            .map(|(score, row)| AnomalyRecord {
                row: row.clone(),
                verdict: Verdict::Density {
                    score,
                    threshold: model.threshold,
                    anomalous: score > model.threshold,
                },
            })
            .collect();

        info!(
            component = "anomaly",
            event = "anomaly.density.score.finish",
            rows = records.len(),
            flagged = records.iter().filter(|r| r.verdict.is_anomalous()).count()
        );

        Ok(records)
    }
}

fn build_node(
    data: &Array2<f64>,
    indices: Vec<usize>,
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> IsolationNode {
    if depth >= max_depth || indices.len() <= 1 {
        return IsolationNode::Leaf { size: indices.len() };
    }

    let feature = rng.gen_range(0..data.ncols());
    let (min, max) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
        let v = data[[i, feature]];
        (lo.min(v), hi.max(v))
    });
    if max - min <= 1e-12 {
        return IsolationNode::Leaf { size: indices.len() };
    }

    let value = rng.gen_range(min..max);
    let (left, right): (Vec<usize>, Vec<usize>) =
        indices.into_iter().partition(|&i| data[[i, feature]] < value);

    IsolationNode::Split {
        feature,
        value,
        left: Box::new(build_node(data, left, depth + 1, max_depth, rng)),
        right: Box::new(build_node(data, right, depth + 1, max_depth, rng)),
    }
}

/// Linearly interpolated quantile of ascending `sorted`, `q` in `[0, 1]`.
fn linear_quantile(sorted: &[f64], q: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };
    let position = q.clamp(0.0, 1.0) * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

/// Mean path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
