//! Squared-error regression tree used by both tree ensembles.

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Candidate features drawn per split; `None` means every allowed feature.
    pub max_features: Option<usize>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 12,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegressionTree {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<RegressionTree>,
        right: Box<RegressionTree>,
    },
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl RegressionTree {
    /// Fits on `rows` of `inputs`, splitting only on `features`.
    pub fn fit(
        inputs: ArrayView2<'_, f64>,
        targets: &[f64],
        rows: Vec<usize>,
        features: &[usize],
        config: &TreeConfig,
        rng: &mut StdRng,
    ) -> Self {
        build(inputs, targets, rows, features, config, 0, rng)
    }

    pub fn predict(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut node = self;
        loop {
            match node {
                Self::Leaf { value } => return *value,
                Self::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf { .. } => 0,
            Self::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

fn build(
    inputs: ArrayView2<'_, f64>,
    targets: &[f64],
    rows: Vec<usize>,
    features: &[usize],
    config: &TreeConfig,
    depth: usize,
    rng: &mut StdRng,
) -> RegressionTree {
    let value = mean(rows.iter().map(|&i| targets[i]));
    if depth >= config.max_depth || rows.len() < config.min_samples_split.max(2) || features.is_empty() {
        return RegressionTree::Leaf { value };
    }

    let candidates: Vec<usize> = match config.max_features {
        Some(m) if m < features.len() => sample(rng, features.len(), m.max(1))
            .into_iter()
            .map(|i| features[i])
            .collect(),
        _ => features.to_vec(),
    };

    let Some(split) = best_split(inputs, targets, &rows, &candidates, config.min_samples_leaf.max(1)) else {
        return RegressionTree::Leaf { value };
    };

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
        .into_iter()
        .partition(|&i| inputs[[i, split.feature]] <= split.threshold);

    RegressionTree::Split {
        feature: split.feature,
        threshold: split.threshold,
        left: Box::new(build(inputs, targets, left_rows, features, config, depth + 1, rng)),
        right: Box::new(build(inputs, targets, right_rows, features, config, depth + 1, rng)),
    }
}

/// Exhaustive search for the split with the largest squared-error reduction.
fn best_split(
    inputs: ArrayView2<'_, f64>,
    targets: &[f64],
    rows: &[usize],
    candidates: &[usize],
    min_leaf: usize,
) -> Option<SplitCandidate> {
    let n = rows.len();
    let total_sum: f64 = rows.iter().map(|&i| targets[i]).sum();
    let parent_score = total_sum * total_sum / n as f64;

    let min_gain = 1e-12 * parent_score.abs().max(1.0);

    let mut best: Option<SplitCandidate> = None;
    let mut order = rows.to_vec();
    for &feature in candidates {
        order.sort_by(|&a, &b| inputs[[a, feature]].total_cmp(&inputs[[b, feature]]));

        let mut left_sum = 0.0;
        for pos in 0..n - 1 {
            left_sum += targets[order[pos]];
            let left_n = pos + 1;
            let right_n = n - left_n;
            if left_n < min_leaf || right_n < min_leaf {
                continue;
            }
            let here = inputs[[order[pos], feature]];
            let next = inputs[[order[pos + 1], feature]];
            if next <= here {
                continue;
            }

            let right_sum = total_sum - left_sum;
            let gain = left_sum * left_sum / left_n as f64 + right_sum * right_sum / right_n as f64
                - parent_score;
            if gain > min_gain && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: here + (next - here) / 2.0,
                    gain,
                });
            }
        }
    }
    best
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn learns_step_function() {
        let inputs = array![[1.0], [2.0], [3.0], [10.0], [11.0], [12.0]];
        let targets = [5.0, 5.0, 5.0, 9.0, 9.0, 9.0];
        let mut rng = StdRng::seed_from_u64(3);
        let tree = RegressionTree::fit(
            inputs.view(),
            &targets,
            (0..6).collect(),
            &[0],
            &TreeConfig::default(),
            &mut rng,
        );

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict(array![2.5].view()), 5.0);
        assert_eq!(tree.predict(array![20.0].view()), 9.0);
    }

    #[test]
    fn constant_target_is_a_leaf() {
        let inputs = array![[1.0, 4.0], [2.0, 3.0], [3.0, 2.0]];
        let mut rng = StdRng::seed_from_u64(3);
        let tree = RegressionTree::fit(
            inputs.view(),
            &[7.0, 7.0, 7.0],
            vec![0, 1, 2],
            &[0, 1],
            &TreeConfig::default(),
            &mut rng,
        );
        assert_eq!(tree, RegressionTree::Leaf { value: 7.0 });
    }
}
