//! Single-column z-score outliers.

use serde::{Deserialize, Serialize};

use super::AnomalyError;
use crate::features::{FeatureRow, FeatureTable};

pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZScoreAnomaly {
    pub row: FeatureRow,
    pub zscore: f64,
}

/// Rows whose `|x - mean| / std` on `column` exceeds `threshold`, using the
/// sample standard deviation. A column with no spread has no outliers.
pub fn zscore_anomalies(
    features: &FeatureTable,
    column: &str,
    threshold: f64,
) -> Result<Vec<ZScoreAnomaly>, AnomalyError> {
    let values = features.column(column)?;
    if values.len() < 2 {
        return Err(AnomalyError::InsufficientHistory {
            required: 2,
            available: values.len(),
        });
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    let std = variance.sqrt();
    if !std.is_finite() || std <= f64::EPSILON {
        return Ok(Vec::new());
    }

    Ok(values
        .iter()
        .zip(&features.rows)
        .filter_map(|(value, row)| {
            let zscore = (value - mean) / std;
            (zscore.abs() > threshold).then(|| ZScoreAnomaly {
                row: row.clone(),
                zscore,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_feature_schema, FeatureSet};
    use crate::market_data::PriceRecord;

    fn table(returns: &[f64]) -> FeatureTable {
        let rows = returns
            .iter()
            .enumerate()
            .map(|(i, r)| FeatureRow {
                record: PriceRecord {
                    open_time_ms: i as i64 * 3_600_000,
                    open_price: 1.0,
                    high_price: 1.0,
                    low_price: 1.0,
                    close_price: 1.0,
                    volume: 1.0,
                },
                values: vec![*r, 0.0, 0.0, 0.0],
            })
            .collect();
        FeatureTable::from_rows(build_feature_schema(FeatureSet::Anomaly), rows)
    }

    #[test]
    fn flags_single_spike() {
        let mut returns = vec![0.0; 30];
        returns[17] = 0.5;
        let found = zscore_anomalies(&table(&returns), "return_1", DEFAULT_ZSCORE_THRESHOLD).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].row.record.open_time_ms, 17 * 3_600_000);
        assert!(found[0].zscore > 3.0);
    }

    #[test]
    fn flat_column_has_no_outliers() {
        let found = zscore_anomalies(&table(&[0.1; 10]), "return_1", 3.0).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn unknown_column_is_an_error() {
        assert!(zscore_anomalies(&table(&[0.1; 10]), "ma_7", 3.0).is_err());
    }
}
