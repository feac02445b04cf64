use cmi::{
    build_feature_schema, build_features, flagged, zscore_anomalies, AnomalyError, AnomalyScorer,
    DensityScorer, FeatureConfig, FeatureRow, FeatureSet, FeatureTable, IsolationForestConfig,
    PriceRecord, ReconstructionConfig, ReconstructionScorer, ThresholdPolicy, Verdict,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const START_MS: i64 = 1_735_689_600_000;
const HOUR_MS: i64 = 3_600_000;

fn price(i: usize, close: f64) -> PriceRecord {
    PriceRecord {
        open_time_ms: START_MS + i as i64 * HOUR_MS,
        open_price: close,
        high_price: close,
        low_price: close,
        close_price: close,
        volume: 1.0,
    }
}

fn anomaly_table(values: Vec<[f64; 4]>) -> FeatureTable {
    let rows = values
        .into_iter()
        .enumerate()
        .map(|(i, v)| FeatureRow {
            record: price(i, 100.0),
            values: v.to_vec(),
        })
        .collect();
    FeatureTable::from_rows(build_feature_schema(FeatureSet::Anomaly), rows)
}

fn random_table(rows: usize, seed: u64) -> FeatureTable {
    let mut rng = StdRng::seed_from_u64(seed);
    anomaly_table(
        (0..rows)
            .map(|_| {
                [
                    rng.gen_range(-0.02..0.02),
                    rng.gen_range(-0.05..0.05),
                    rng.gen_range(-0.1..0.1),
                    rng.gen_range(0.1..2.0),
                ]
            })
            .collect(),
    )
}

fn small_reconstruction(policy: ThresholdPolicy) -> ReconstructionConfig {
    ReconstructionConfig {
        seq_length: 8,
        hidden_units: 8,
        latent_units: 4,
        epochs: 5,
        batch_size: 16,
        threshold_policy: policy,
        ..ReconstructionConfig::default()
    }
}

#[test]
fn density_scorer_flags_its_contamination_share() {
    let table = random_table(1_000, 7);
    let scorer = DensityScorer::new(IsolationForestConfig {
        n_estimators: 100,
        ..IsolationForestConfig::default()
    });

    let model = scorer.train(&table).unwrap();
    let records = scorer.score(&table, &model).unwrap();
    let hits = flagged(&records);

    assert_eq!(records.len(), 1_000);
    assert!((15..=25).contains(&hits.len()), "flagged {}", hits.len());
    for record in &records {
        match record.verdict {
            Verdict::Density {
                score,
                threshold,
                anomalous,
            } => {
                assert!(score > 0.0 && score <= 1.0);
                assert_eq!(anomalous, score > threshold);
            }
            _ => panic!("density scorer returned a reconstruction verdict"),
        }
    }
}

#[test]
fn density_scorer_rejects_a_table_from_another_feature_set() {
    let table = random_table(200, 3);
    let scorer = DensityScorer::new(IsolationForestConfig {
        n_estimators: 20,
        ..IsolationForestConfig::default()
    });
    let model = scorer.train(&table).unwrap();

    let records: Vec<PriceRecord> = (0..60)
        .map(|i| price(i, 100.0 + (i as f64 * 0.5).sin() * 3.0))
        .collect();
    let (ml_table, _) = build_features(&records, FeatureSet::Ml, &FeatureConfig::default()).unwrap();

    assert!(matches!(
        scorer.score(&ml_table, &model),
        Err(AnomalyError::ModelMismatch(_))
    ));
}

#[test]
fn identical_windows_are_never_flagged() {
    let table = anomaly_table(vec![[0.01, 0.02, 0.03, 0.5]; 64]);

    for policy in [ThresholdPolicy::PerBatch, ThresholdPolicy::Training] {
        for k in [0.0, 1.0, 2.5] {
            let scorer = ReconstructionScorer::new(ReconstructionConfig {
                threshold_factor: k,
                ..small_reconstruction(policy)
            });
            let model = scorer.train(&table).unwrap();
            let records = scorer.score(&table, &model).unwrap();

            assert_eq!(records.len(), 64 - 8);
            assert!(flagged(&records).is_empty(), "policy {policy:?} k {k}");
        }
    }
}

#[test]
fn reconstruction_verdict_points_at_window_start() {
    let table = random_table(120, 11);
    let scorer = ReconstructionScorer::new(small_reconstruction(ThresholdPolicy::PerBatch));
    let model = scorer.train(&table).unwrap();
    let records = scorer.score(&table, &model).unwrap();

    assert_eq!(records.len(), 120 - 8);
    assert_eq!(records[0].row, table.rows[0]);
    assert_eq!(records[5].row, table.rows[5]);
    assert!(matches!(
        records[0].verdict,
        Verdict::Reconstruction { window_len: 8, .. }
    ));
}

#[test]
fn reconstruction_needs_more_rows_than_the_window() {
    let table = random_table(8, 5);
    let scorer = ReconstructionScorer::new(small_reconstruction(ThresholdPolicy::PerBatch));
    assert!(matches!(
        scorer.train(&table),
        Err(AnomalyError::Sequence(_))
    ));
}

#[test]
fn zscore_flags_a_single_spike() {
    let mut values = vec![[0.001, 0.0, 0.0, 1.0]; 40];
    for (i, row) in values.iter_mut().enumerate() {
        row[0] = if i % 2 == 0 { 0.001 } else { -0.001 };
    }
    values[20][0] = 0.08;
    let table = anomaly_table(values);

    let hits = zscore_anomalies(&table, "return_1", 3.0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, table.rows[20]);
    assert!(hits[0].zscore > 3.0);

    assert!(zscore_anomalies(&table, "volatility_6", 3.0).unwrap().is_empty());
}

#[test]
fn density_scorer_flags_a_planted_outlier_in_a_short_table() {
    let scorer = DensityScorer::default();
    for rows in [30, 45, 49] {
        let mut table = random_table(rows, 11);
        table.rows[0].values[3] = 50.0;

        let model = scorer.train(&table).unwrap();
        let records = scorer.score(&table, &model).unwrap();

        assert!(records[0].verdict.is_anomalous(), "rows={rows}");
        assert_eq!(flagged(&records).len(), 1, "rows={rows}");
    }
}
