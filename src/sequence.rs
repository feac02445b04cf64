//! Fixed-length window construction and the global normaliser shared by the
//! sequence models.

use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::FeatureTable;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("invalid window length {0}")]
    InvalidLength(usize),
    #[error("insufficient history: window length {seq_length} needs more than {rows} rows")]
    InsufficientHistory { seq_length: usize, rows: usize },
    #[error("cannot fit a normaliser on an empty table")]
    EmptyTable,
    #[error("table has zero or non-finite spread (std={std})")]
    ZeroVariance { std: f64 },
}

/// One mean and one standard deviation over every cell of the training table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: f64,
    pub std: f64,
}

impl Normalizer {
    /// Population standard deviation; the pair is meant to be persisted with the model.
    pub fn fit(data: ArrayView2<'_, f64>) -> Result<Self, SequenceError> {
        if data.is_empty() {
            return Err(SequenceError::EmptyTable);
        }
        let count = data.len() as f64;
        let mean = data.iter().sum::<f64>() / count;
        let variance = data
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / count;
        let std = variance.sqrt();
        if !std.is_finite() || std <= f64::EPSILON {
            return Err(SequenceError::ZeroVariance { std });
        }
        Ok(Self { mean, std })
    }

    pub fn normalize(&self, data: ArrayView2<'_, f64>) -> Array2<f64> {
        data.mapv(|v| self.normalize_value(v))
    }

    pub fn denormalize(&self, data: ArrayView2<'_, f64>) -> Array2<f64> {
        data.mapv(|v| self.denormalize_value(v))
    }

    pub fn normalize_value(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }

    pub fn denormalize_value(&self, value: f64) -> f64 {
        value * self.std + self.mean
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisedWindows {
    /// `(n, L, F)`
    pub inputs: Array3<f64>,
    /// `(n, F)`, row `i` is the row right after window `i`.
    pub targets: Array2<f64>,
}

impl SupervisedWindows {
    pub fn len(&self) -> usize {
        self.targets.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Windows produced from a feature table, one per start row across all
/// contiguous segments.
#[derive(Debug, Clone, PartialEq)]
pub struct TableWindows {
    pub windows: Array3<f64>,
    /// Table row index of each window's first row.
    pub starts: Vec<usize>,
}

/// All `T - L` overlapping windows of a `T x F` table.
pub fn build_windows(data: ArrayView2<'_, f64>, seq_length: usize) -> Result<Array3<f64>, SequenceError> {
    let starts = window_starts(data.nrows(), seq_length)?;
    Ok(gather_windows(data, &starts, seq_length))
}

pub fn build_supervised_windows(
    data: ArrayView2<'_, f64>,
    seq_length: usize,
) -> Result<SupervisedWindows, SequenceError> {
    let starts = window_starts(data.nrows(), seq_length)?;
    Ok(SupervisedWindows {
        inputs: gather_windows(data, &starts, seq_length),
        targets: gather_targets(data, &starts, seq_length),
    })
}

/// The trailing `L` rows, used as the inference input.
pub fn latest_window(data: ArrayView2<'_, f64>, seq_length: usize) -> Result<Array2<f64>, SequenceError> {
    if seq_length == 0 {
        return Err(SequenceError::InvalidLength(seq_length));
    }
    let rows = data.nrows();
    if rows < seq_length {
        return Err(SequenceError::InsufficientHistory { seq_length, rows });
    }
    Ok(data.slice(ndarray::s![rows - seq_length.., ..]).to_owned())
}

/// Normalises the table and windows each contiguous segment on its own.
pub fn table_windows(
    table: &FeatureTable,
    normalizer: &Normalizer,
    seq_length: usize,
) -> Result<TableWindows, SequenceError> {
    let data = normalizer.normalize(table.matrix().view());
    let starts = segment_window_starts(table, seq_length)?;
    Ok(TableWindows {
        windows: gather_windows(data.view(), &starts, seq_length),
        starts,
    })
}

pub fn table_supervised_windows(
    table: &FeatureTable,
    normalizer: &Normalizer,
    seq_length: usize,
) -> Result<SupervisedWindows, SequenceError> {
    let data = normalizer.normalize(table.matrix().view());
    let starts = segment_window_starts(table, seq_length)?;
    Ok(SupervisedWindows {
        inputs: gather_windows(data.view(), &starts, seq_length),
        targets: gather_targets(data.view(), &starts, seq_length),
    })
}

/// Flattens each `(L, F)` window into one row of `L * F` values, time-major.
pub fn flatten_windows(windows: &Array3<f64>) -> Array2<f64> {
    let (n, len, width) = windows.dim();
    Array2::from_shape_fn((n, len * width), |(w, idx)| windows[[w, idx / width, idx % width]])
}

fn window_starts(rows: usize, seq_length: usize) -> Result<Vec<usize>, SequenceError> {
    if seq_length == 0 {
        return Err(SequenceError::InvalidLength(seq_length));
    }
    if rows <= seq_length {
        return Err(SequenceError::InsufficientHistory { seq_length, rows });
    }
    Ok((0..rows - seq_length).collect())
}

fn segment_window_starts(table: &FeatureTable, seq_length: usize) -> Result<Vec<usize>, SequenceError> {
    if seq_length == 0 {
        return Err(SequenceError::InvalidLength(seq_length));
    }
    let mut starts = Vec::new();
    let mut longest = 0;
    for segment in table.segments() {
        longest = longest.max(segment.len());
        if segment.len() <= seq_length {
            continue;
        }
        starts.extend(segment.start..segment.end - seq_length);
    }
    if starts.is_empty() {
        return Err(SequenceError::InsufficientHistory {
            seq_length,
            rows: longest,
        });
    }
    Ok(starts)
}

fn gather_windows(data: ArrayView2<'_, f64>, starts: &[usize], seq_length: usize) -> Array3<f64> {
    Array3::from_shape_fn((starts.len(), seq_length, data.ncols()), |(w, t, f)| {
        data[[starts[w] + t, f]]
    })
}

fn gather_targets(data: ArrayView2<'_, f64>, starts: &[usize], seq_length: usize) -> Array2<f64> {
    Array2::from_shape_fn((starts.len(), data.ncols()), |(w, f)| {
        data[[starts[w] + seq_length, f]]
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{array, s};

    use super::*;

    #[test]
    fn supervised_targets_follow_their_window() {
        let data = Array2::from_shape_fn((6, 2), |(i, j)| (i * 10 + j) as f64);
        let windows = build_supervised_windows(data.view(), 3).unwrap();

        assert_eq!(windows.len(), 3);
        assert_eq!(windows.inputs.dim(), (3, 3, 2));
        for w in 0..windows.len() {
            assert_eq!(windows.inputs.slice(s![w, 2, ..]), data.slice(s![w + 2, ..]));
            assert_eq!(windows.targets.slice(s![w, ..]), data.slice(s![w + 3, ..]));
        }
    }

    #[test]
    fn table_not_longer_than_window_is_rejected() {
        let data = Array2::<f64>::zeros((4, 2));
        let err = build_windows(data.view(), 4).unwrap_err();
        assert!(matches!(
            err,
            SequenceError::InsufficientHistory {
                seq_length: 4,
                rows: 4
            }
        ));
        assert!(matches!(
            build_windows(data.view(), 0),
            Err(SequenceError::InvalidLength(0))
        ));
    }

    #[test]
    fn latest_window_accepts_exact_length() {
        let data = array![[1.0], [2.0], [3.0]];
        let window = latest_window(data.view(), 3).unwrap();
        assert_eq!(window, data);
        let tail = latest_window(data.view(), 2).unwrap();
        assert_eq!(tail, array![[2.0], [3.0]]);
    }

    #[test]
    fn flatten_keeps_time_major_order() {
        let windows = Array3::from_shape_fn((2, 3, 2), |(w, t, f)| (w * 100 + t * 10 + f) as f64);
        let flat = flatten_windows(&windows);
        assert_eq!(flat.dim(), (2, 6));
        assert_eq!(flat[[1, 3]], 111.0);
    }

    #[test]
    fn normalizer_uses_population_std() {
        let data = array![[1.0, 3.0], [1.0, 3.0]];
        let normalizer = Normalizer::fit(data.view()).unwrap();
        assert_eq!(normalizer.mean, 2.0);
        assert_eq!(normalizer.std, 1.0);

        let constant = array![[5.0, 5.0]];
        assert!(matches!(
            Normalizer::fit(constant.view()),
            Err(SequenceError::ZeroVariance { .. })
        ));
    }
}
