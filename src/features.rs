//! Price series to feature table transform.
//!
//! Two feature sets exist and are never merged: [`FeatureSet::Anomaly`] feeds the
//! anomaly scorers and [`FeatureSet::Ml`] feeds the price predictors. Each table
//! carries the schema it was built with so a consumer can reject the wrong set.

use std::ops::Range;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::market_data::{validate_price_series, MarketDataError, PriceRecord};

const MAX_REPORTED_GAP_RANGES: usize = 256;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureSet {
    Anomaly,
    Ml,
}

const ANOMALY_COLUMNS: [FeatureColumn; 4] = [
    FeatureColumn::Return(1),
    FeatureColumn::Return(6),
    FeatureColumn::Return(24),
    FeatureColumn::Volatility(6),
];

const ML_COLUMNS: [FeatureColumn; 11] = [
    FeatureColumn::OpenPrice,
    FeatureColumn::HighPrice,
    FeatureColumn::LowPrice,
    FeatureColumn::ClosePrice,
    FeatureColumn::Volume,
    FeatureColumn::Return(1),
    FeatureColumn::Return(6),
    FeatureColumn::Return(24),
    FeatureColumn::RollingMean(7),
    FeatureColumn::RollingMean(25),
    FeatureColumn::Volatility(6),
];

impl FeatureSet {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anomaly => "anomaly",
            Self::Ml => "ml",
        }
    }

    pub fn columns(self) -> &'static [FeatureColumn] {
        match self {
            Self::Anomaly => &ANOMALY_COLUMNS,
            Self::Ml => &ML_COLUMNS,
        }
    }

    /// Leading rows of a contiguous segment that can never produce a complete row.
    pub fn warmup_rows(self) -> usize {
        self.columns()
            .iter()
            .map(|column| column.warmup())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureColumn {
    OpenPrice,
    HighPrice,
    LowPrice,
    ClosePrice,
    Volume,
    Return(usize),
    RollingMean(usize),
    Volatility(usize),
}

impl FeatureColumn {
    pub fn name(self) -> String {
        match self {
            Self::OpenPrice => "open_price".to_string(),
            Self::HighPrice => "high_price".to_string(),
            Self::LowPrice => "low_price".to_string(),
            Self::ClosePrice => "close_price".to_string(),
            Self::Volume => "volume".to_string(),
            Self::Return(periods) => format!("return_{periods}"),
            Self::RollingMean(window) => format!("ma_{window}"),
            Self::Volatility(window) => format!("volatility_{window}"),
        }
    }

    pub fn warmup(self) -> usize {
        match self {
            Self::OpenPrice | Self::HighPrice | Self::LowPrice | Self::ClosePrice | Self::Volume => 0,
            Self::Return(periods) => periods,
            Self::RollingMean(window) | Self::Volatility(window) => window.saturating_sub(1),
        }
    }

    fn compute(self, segment: &[PriceRecord], closes: &[f64]) -> Vec<Option<f64>> {
        match self {
            Self::OpenPrice => segment.iter().map(|r| Some(r.open_price)).collect(),
            Self::HighPrice => segment.iter().map(|r| Some(r.high_price)).collect(),
            Self::LowPrice => segment.iter().map(|r| Some(r.low_price)).collect(),
            Self::ClosePrice => closes.iter().copied().map(Some).collect(),
            Self::Volume => segment.iter().map(|r| Some(r.volume)).collect(),
            Self::Return(periods) => pct_change(closes, periods),
            Self::RollingMean(window) => rolling_mean(closes, window),
            Self::Volatility(window) => rolling_std(closes, window),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub feature_set: FeatureSet,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

impl FeatureSchema {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub record: PriceRecord,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    segment_starts: Vec<usize>,
}

impl FeatureTable {
    /// Wraps rows that are already known to be one contiguous segment.
    pub fn from_rows(schema: FeatureSchema, rows: Vec<FeatureRow>) -> Self {
        let segment_starts = if rows.is_empty() { Vec::new() } else { vec![0] };
        Self {
            schema,
            rows,
            segment_starts,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn feature_set(&self) -> FeatureSet {
        self.schema.feature_set
    }

    /// Row ranges that are free of continuity gaps.
    pub fn segments(&self) -> Vec<Range<usize>> {
        let mut out = Vec::with_capacity(self.segment_starts.len());
        for (idx, start) in self.segment_starts.iter().enumerate() {
            let end = self
                .segment_starts
                .get(idx + 1)
                .copied()
                .unwrap_or(self.rows.len());
            out.push(*start..end);
        }
        out
    }

    /// Feature values as a `rows x columns` matrix, timestamp excluded.
    pub fn matrix(&self) -> Array2<f64> {
        let width = self.schema.width();
        Array2::from_shape_fn((self.rows.len(), width), |(i, j)| self.rows[i].values[j])
    }

    pub fn column(&self, name: &str) -> Result<Vec<f64>, FeatureError> {
        let index = self
            .schema
            .column_index(name)
            .ok_or_else(|| FeatureError::UnknownColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|row| row.values[index]).collect())
    }

    pub fn require_set(&self, expected: FeatureSet) -> Result<(), FeatureError> {
        if self.schema.feature_set != expected {
            return Err(FeatureError::WrongFeatureSet {
                expected,
                actual: self.schema.feature_set,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapPolicy {
    Strict,
    ReportAndSkip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Expected spacing between consecutive records; `None` disables the continuity check.
    pub interval_ms: Option<i64>,
    pub gap_policy: GapPolicy,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            interval_ms: Some(3_600_000),
            gap_policy: GapPolicy::ReportAndSkip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub warmup_dropped_rows: u64,
    /// Rows past warm-up whose features were undefined; each one splits its segment.
    pub undefined_dropped_rows: u64,
    pub segments: u64,
    pub gap_ranges: Vec<(i64, i64)>,
    pub first_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Series(#[from] MarketDataError),
    #[error("insufficient history: need at least {required} contiguous rows, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error(
        "continuity gap detected from {expected_next_ms} to {actual_ms} ({missing_points} missing points)"
    )]
    ContinuityGap {
        expected_next_ms: i64,
        actual_ms: i64,
        missing_points: u64,
    },
    #[error("feature table built for {actual:?} features, expected {expected:?}")]
    WrongFeatureSet {
        expected: FeatureSet,
        actual: FeatureSet,
    },
    #[error("unknown feature column {0}")]
    UnknownColumn(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn build_feature_schema(set: FeatureSet) -> FeatureSchema {
    let columns: Vec<String> = set.columns().iter().map(|column| column.name()).collect();
    let fingerprint = schema_fingerprint(set, &columns);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        feature_set: set,
        fingerprint,
        columns,
    }
}

pub fn build_features(
    records: &[PriceRecord],
    set: FeatureSet,
    cfg: &FeatureConfig,
) -> Result<(FeatureTable, FeatureBuildReport), FeatureError> {
    validate_config(cfg)?;
    validate_price_series(records)?;

    info!(
        component = "features",
        event = "features.build.start",
        feature_set = set.as_str(),
        input_rows = records.len(),
        interval_ms = ?cfg.interval_ms,
        gap_policy = ?cfg.gap_policy
    );

    let schema = build_feature_schema(set);
    let mut report = FeatureBuildReport {
        input_rows: records.len() as u64,
        output_rows: 0,
        warmup_dropped_rows: 0,
        undefined_dropped_rows: 0,
        segments: 0,
        gap_ranges: Vec::new(),
        first_error: None,
    };

    let segments = split_segments(records, cfg, &mut report)?;
    let longest_segment = segments.iter().map(|s| s.len()).max().unwrap_or(0);

    let mut rows = Vec::new();
    let mut segment_starts = Vec::new();
    for segment in &segments {
        let transformed = transform_segment(segment, set);
        report.warmup_dropped_rows += transformed.warmup_dropped as u64;
        report.undefined_dropped_rows += transformed.undefined_dropped as u64;
        for run in transformed.runs {
            segment_starts.push(rows.len());
            rows.extend(run);
        }
    }

    if rows.is_empty() {
        return Err(FeatureError::InsufficientHistory {
            required: set.warmup_rows() + 1,
            available: longest_segment,
        });
    }

    report.output_rows = rows.len() as u64;
    report.segments = segment_starts.len() as u64;

    info!(
        component = "features",
        event = "features.build.finish",
        feature_set = set.as_str(),
        fingerprint = %schema.fingerprint,
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        warmup_dropped_rows = report.warmup_dropped_rows,
        undefined_dropped_rows = report.undefined_dropped_rows,
        segments = report.segments
    );

    Ok((
        FeatureTable {
            schema,
            rows,
            segment_starts,
        },
        report,
    ))
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// `(x[t] - x[t-k]) / x[t-k]`; undefined for the first `k` entries.
pub fn pct_change(values: &[f64], periods: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, current)| {
            if periods == 0 || i < periods {
                return None;
            }
            let base = values[i - periods];
            finite((current - base) / base)
        })
        .collect()
}

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            finite(slice.iter().sum::<f64>() / window as f64)
        })
        .collect()
}

/// Sample standard deviation (`n - 1` denominator) over a trailing window.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window < 2 || i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            let mean = slice.iter().sum::<f64>() / window as f64;
            let variance = slice
                .iter()
                .map(|v| {
                    let d = *v - mean;
                    d * d
                })
                .sum::<f64>()
                / (window - 1) as f64;
            finite(variance.sqrt())
        })
        .collect()
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if let Some(interval_ms) = cfg.interval_ms {
        if interval_ms <= 0 {
            return Err(FeatureError::InvalidConfig(
                "interval_ms must be > 0".to_string(),
            ));
        }
    }
    Ok(())
}

fn split_segments<'a>(
    records: &'a [PriceRecord],
    cfg: &FeatureConfig,
    report: &mut FeatureBuildReport,
) -> Result<Vec<&'a [PriceRecord]>, FeatureError> {
    let Some(step) = cfg.interval_ms else {
        return Ok(vec![records]);
    };

    let mut segments = Vec::new();
    let mut start = 0;
    for idx in 1..records.len() {
        let expected_next_ms = records[idx - 1].open_time_ms + step;
        let actual_ms = records[idx].open_time_ms;
        if actual_ms == expected_next_ms {
            continue;
        }

        let missing_points = ((actual_ms - expected_next_ms).max(0) / step) as u64;
        match cfg.gap_policy {
            GapPolicy::Strict => {
                return Err(FeatureError::ContinuityGap {
                    expected_next_ms,
                    actual_ms,
                    missing_points,
                })
            }
            GapPolicy::ReportAndSkip => {
                warn!(
                    component = "features",
                    event = "features.build.gap_detected",
                    expected_next_ms = expected_next_ms,
                    actual_ms = actual_ms,
                    missing_points = missing_points
                );
                if report.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
                    report.gap_ranges.push((expected_next_ms, actual_ms));
                }
                if report.first_error.is_none() {
                    report.first_error = Some(format!(
                        "continuity gap from {expected_next_ms} to {actual_ms}"
                    ));
                }
                segments.push(&records[start..idx]);
                start = idx;
            }
        }
    }
    segments.push(&records[start..]);
    Ok(segments)
}

struct TransformedSegment {
    runs: Vec<Vec<FeatureRow>>,
    warmup_dropped: usize,
    undefined_dropped: usize,
}

/// Complete rows of one gap-free segment, split into runs wherever a row
/// past warm-up has an undefined feature.
fn transform_segment(segment: &[PriceRecord], set: FeatureSet) -> TransformedSegment {
    let closes: Vec<f64> = segment.iter().map(|record| record.close_price).collect();
    let series: Vec<Vec<Option<f64>>> = set
        .columns()
        .iter()
        .map(|column| column.compute(segment, &closes))
        .collect();

    let mut out = TransformedSegment {
        runs: Vec::new(),
        warmup_dropped: 0,
        undefined_dropped: 0,
    };
    let mut current: Vec<FeatureRow> = Vec::new();
    'rows: for (idx, record) in segment.iter().enumerate() {
        let mut values = Vec::with_capacity(series.len());
        for column in &series {
            match column[idx] {
                Some(value) if value.is_finite() => values.push(value),
                _ => {
                    if out.runs.is_empty() && current.is_empty() {
                        out.warmup_dropped += 1;
                    } else {
                        out.undefined_dropped += 1;
                        if !current.is_empty() {
                            warn!(
                                component = "features",
                                event = "features.build.undefined_row",
                                open_time_ms = record.open_time_ms,
                                feature_set = set.as_str()
                            );
                            out.runs.push(std::mem::take(&mut current));
                        }
                    }
                    continue 'rows;
                }
            }
        }
        current.push(FeatureRow {
            record: *record,
            values,
        });
    }
    if !current.is_empty() {
        out.runs.push(current);
    }
    out
}

fn schema_fingerprint(set: FeatureSet, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("set:{};", set.as_str()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_change_matches_definition() {
        let closes = [100.0, 102.0, 101.0, 105.0, 99.0, 98.0, 103.0];
        let returns = pct_change(&closes, 1);
        assert_eq!(returns[0], None);
        assert!((returns[1].unwrap() - 0.02).abs() < 1e-12);

        let returns_6 = pct_change(&closes, 6);
        assert!(returns_6[..6].iter().all(Option::is_none));
        assert!((returns_6[6].unwrap() - 0.03).abs() < 1e-12);
    }

    #[test]
    fn pct_change_from_zero_price_is_undefined() {
        let returns = pct_change(&[0.0, 1.0], 1);
        assert_eq!(returns, vec![None, None]);
    }

    #[test]
    fn rolling_stats_need_full_window() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let means = rolling_mean(&values, 3);
        assert_eq!(means[..2], [None, None]);
        assert_eq!(means[2], Some(2.0));
        assert_eq!(means[3], Some(3.0));

        let stds = rolling_std(&values, 3);
        assert_eq!(stds[1], None);
        assert!((stds[2].unwrap() - 1.0).abs() < 1e-12);
        assert!(rolling_std(&values, 1).iter().all(Option::is_none));
    }

    #[test]
    fn feature_sets_are_distinct() {
        let anomaly = build_feature_schema(FeatureSet::Anomaly);
        let ml = build_feature_schema(FeatureSet::Ml);

        assert_eq!(
            anomaly.columns,
            vec!["return_1", "return_6", "return_24", "volatility_6"]
        );
        assert_eq!(ml.columns.len(), 11);
        assert_eq!(ml.columns[3], "close_price");
        assert_eq!(ml.columns[9], "ma_25");
        assert_ne!(anomaly.fingerprint, ml.fingerprint);
        assert_eq!(FeatureSet::Anomaly.warmup_rows(), 24);
        assert_eq!(FeatureSet::Ml.warmup_rows(), 24);
    }
}
