mod common;

use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{scenario_batch, trained_model, tx};
use credit_risk::{
    log_app_bind, log_app_start, log_model_loaded, scoring_router, FeaturePipeline, LoggingConfig,
    SharedModelSource,
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

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("risk_api_server", &cfg);
        log_model_loaded("CreditRiskModel", 3, "abc123");
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"model.loaded\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"component\":\"risk_api_server\""));
}

#[test]
fn pipeline_fit_logs_start_and_finish() {
    let logs = capture_logs(Level::INFO, || {
        let mut pipeline = FeaturePipeline::default();
        pipeline
            .fit_transform(&scenario_batch())
            .expect("fit succeeds");
    });

    assert!(logs.contains("\"event\":\"pipeline.fit.start\""));
    assert!(logs.contains("\"event\":\"encoder.fit.finish\""));
    assert!(logs.contains("\"event\":\"pipeline.fit.finish\""));
}

#[test]
fn malformed_timestamps_are_logged_as_warnings() {
    let logs = capture_logs(Level::WARN, || {
        let mut batch = scenario_batch();
        batch.push(tx("300", 1.0, "not-a-timestamp"));
        let mut pipeline = FeaturePipeline::default();
        pipeline.fit_transform(&batch).expect("lenient fit");
    });

    assert!(logs.contains("\"event\":\"time_features.malformed_timestamp\""));
    assert!(logs.contains("not-a-timestamp"));
    assert!(!logs.contains("\"event\":\"pipeline.fit.finish\""));
}

#[test]
fn predict_route_emits_finish_and_rejection_events() {
    let model = trained_model();
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = scoring_router(Arc::new(SharedModelSource::new(model)));

            let ok = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/predict")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(
                            serde_json::to_string(&[credit_risk::TransactionPayload::from(
                                &tx("C1", 10.0, "2019-02-01 10:00:00"),
                            )])
                            .expect("payload serializes"),
                        ))
                        .expect("request should build"),
                )
                .await
                .expect("predict request should complete");
            assert_eq!(ok.status(), StatusCode::OK);

            let rejected = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/predict")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from("[{\"CustomerId\": \"C1\"}]"))
                        .expect("request should build"),
                )
                .await
                .expect("predict request should complete");
            assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        });
    });

    assert!(logs.contains("\"event\":\"service.predict.finish\""));
    assert!(logs.contains("\"event\":\"service.request.rejected\""));
}
