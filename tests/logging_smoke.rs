use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cmi::{
    api_router, build_features, log_app_bind, log_app_start, log_source_selected,
    EmbeddingStore, FeatureConfig, FeatureSet, InMemoryPriceSource, LoggingConfig, ModelStore,
    PipelineConfig, PipelineContext, PriceRecord,
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn hourly(n: usize, offset_hours: i64) -> Vec<PriceRecord> {
    (0..n)
        .map(|i| {
            let close = 100.0 + (i as f64 * 0.4).sin() * 3.0;
            PriceRecord {
                open_time_ms: 1_735_689_600_000 + (offset_hours + i as i64) * 3_600_000,
                open_price: close,
                high_price: close + 1.0,
                low_price: close - 1.0,
                close_price: close,
                volume: 12.0,
            }
        })
        .collect()
}

#[test]
fn feature_build_logs_gaps_and_summary() {
    let mut records = hourly(40, 0);
    records.extend(hourly(40, 48));

    let logs = capture_logs(Level::INFO, || {
        let (_, report) =
            build_features(&records, FeatureSet::Anomaly, &FeatureConfig::default())
                .expect("gapped series should still build under report-and-skip");
        assert_eq!(report.segments, 2);
    });

    assert!(logs.contains("\"event\":\"features.build.start\""));
    assert!(logs.contains("\"event\":\"features.build.gap_detected\""));
    assert!(logs.contains("\"event\":\"features.build.finish\""));
}

#[test]
fn model_store_logs_saves() {
    let logs = capture_logs(Level::INFO, || {
        let store = ModelStore::open_in_memory().expect("in-memory store should open");
        store
            .save("predictor_random_forest", "random_forest", "abc", &vec![1.0, 2.0])
            .expect("save should succeed");
    });

    assert!(logs.contains("\"event\":\"store.model.saved\""));
    assert!(logs.contains("\"component\":\"store\""));
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("cmi_server", &cfg);
        log_source_selected("cmi_server", "csv", Some("CMI_DATA_SOURCE"));
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"source.selected\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn failed_prediction_route_emits_request_and_error_events() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let context = PipelineContext::new(
                PipelineConfig::default(),
                Box::new(InMemoryPriceSource::new(hourly(60, 0))),
                ModelStore::open_in_memory().expect("in-memory store should open"),
                EmbeddingStore::open_in_memory().expect("in-memory store should open"),
            );
            let app = api_router(Arc::new(Mutex::new(context)));

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/predict/rf")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("predict request should complete");

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        });
    });

    assert!(logs.contains("\"event\":\"context.open\""));
    assert!(logs.contains("\"event\":\"http.predict.request\""));
    assert!(logs.contains("\"event\":\"http.request.error\""));
    assert!(logs.contains("\"error_kind\":\"model_not_found\""));
}
