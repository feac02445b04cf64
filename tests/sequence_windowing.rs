use cmi::{
    build_features, build_supervised_windows, build_windows, latest_window, table_windows,
    FeatureConfig, FeatureSet, Normalizer, PriceRecord, SequenceError,
};
use ndarray::{Array2, Axis};

const START_MS: i64 = 1_735_689_600_000;
const HOUR_MS: i64 = 3_600_000;

fn record(open_time_ms: i64, close: f64) -> PriceRecord {
    PriceRecord {
        open_time_ms,
        open_price: close,
        high_price: close + 2.0,
        low_price: close - 2.0,
        close_price: close,
        volume: 5.0 + (close % 3.0),
    }
}

fn ramp(rows: usize, width: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, width), |(i, j)| (i * width + j) as f64)
}

#[test]
fn window_count_is_rows_minus_length() {
    let data = ramp(10, 3);
    for seq_length in 1..10 {
        let windows = build_windows(data.view(), seq_length).unwrap();
        assert_eq!(windows.dim(), (10 - seq_length, seq_length, 3));
    }
}

#[test]
fn each_target_follows_its_window() {
    let data = ramp(12, 2);
    let supervised = build_supervised_windows(data.view(), 4).unwrap();

    assert_eq!(supervised.len(), 8);
    for (i, window) in supervised.inputs.axis_iter(Axis(0)).enumerate() {
        assert_eq!(window.row(0), data.row(i));
        assert_eq!(window.row(3), data.row(i + 3));
        assert_eq!(supervised.targets.row(i), data.row(i + 4));
    }
}

#[test]
fn too_short_tables_fail_instead_of_returning_nothing() {
    let data = ramp(5, 2);
    assert!(matches!(
        build_windows(data.view(), 5),
        Err(SequenceError::InsufficientHistory {
            seq_length: 5,
            rows: 5
        })
    ));
    assert!(matches!(
        build_windows(data.view(), 0),
        Err(SequenceError::InvalidLength(0))
    ));
    assert_eq!(latest_window(data.view(), 5).unwrap(), data);
}

#[test]
fn normalizer_round_trips_within_tolerance() {
    let data = Array2::from_shape_fn((20, 4), |(i, j)| 1_000.0 + (i as f64).sin() * 50.0 + j as f64);
    let normalizer = Normalizer::fit(data.view()).unwrap();
    let normalized = normalizer.normalize(data.view());

    assert!(normalized.mean().unwrap().abs() < 1e-9);
    let restored = normalizer.denormalize(normalized.view());
    for (a, b) in restored.iter().zip(data.iter()) {
        assert!((a - b).abs() < 1e-9);
    }

    let flat = Array2::from_elem((3, 3), 7.0);
    assert!(matches!(
        Normalizer::fit(flat.view()),
        Err(SequenceError::ZeroVariance { .. })
    ));
}

#[test]
fn table_windows_never_span_a_gap() {
    let mut records: Vec<PriceRecord> = (0..40)
        .map(|i| record(START_MS + i * HOUR_MS, 100.0 + (i as f64 * 0.7).sin() * 4.0))
        .collect();
    records.extend((0..40).map(|i| {
        record(
            START_MS + (50 + i) * HOUR_MS,
            110.0 + (i as f64 * 0.4).cos() * 3.0,
        )
    }));

    let (table, _) =
        build_features(&records, FeatureSet::Anomaly, &FeatureConfig::default()).unwrap();
    assert_eq!(table.segments(), vec![0..16, 16..32]);

    let normalizer = Normalizer::fit(table.matrix().view()).unwrap();
    let windowed = table_windows(&table, &normalizer, 8).unwrap();

    assert_eq!(windowed.starts.len(), 2 * (16 - 8));
    assert!(windowed
        .starts
        .iter()
        .all(|start| (*start < 16 && start + 8 <= 16) || *start >= 16));
    assert_eq!(windowed.windows.dim(), (16, 8, 4));
}
