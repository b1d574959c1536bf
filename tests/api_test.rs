//! HTTP control surface: routing and error status mapping.
#![cfg(feature = "networking")]

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use hv_daq::api::create_router;
use hv_daq::config::store::SettingsStore;
use hv_daq::config::{PortBinding, Settings};
use hv_daq::instrument::mock::SimulatedBench;
use hv_daq::instrument::InstrumentSlot;
use hv_daq::HvApp;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn bench_app() -> (SimulatedBench, Arc<HvApp>) {
    let mut settings = Settings::default();
    settings.telemetry.poll_interval = Duration::ZERO;
    settings
        .instruments
        .insert(InstrumentSlot::HvSource, PortBinding::new("COM1"));
    let bench = SimulatedBench::new();
    let app = HvApp::start(SettingsStore::new(settings), bench.instruments())
        .await
        .unwrap();
    (bench, app)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn state_reports_connected_instruments() {
    let (_bench, app) = bench_app().await;
    let router = create_router(Arc::clone(&app));

    let (status, outcomes) = call(&router, Method::POST, "/api/instruments/connect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes.as_array().unwrap().len(), 1);

    let (status, state) = call(&router, Method::GET, "/api/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["sequencer"]["phase"], "idle");
    assert_eq!(state["controller"]["phase"], "idle");
    assert!(state["sequence"].as_u64().unwrap() >= 1);
    app.shutdown().await;
}

#[tokio::test]
async fn invalid_parameters_are_bad_requests() {
    let (_bench, app) = bench_app().await;
    let router = create_router(Arc::clone(&app));

    let (status, body) = call(
        &router,
        Method::PUT,
        "/api/params/test",
        Some(json!({ "voltage_step": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CONFIG_INVALID");

    let (status, params) = call(&router, Method::GET, "/api/params/test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(params["voltage_step"], 10.0);

    let (status, _) = call(&router, Method::POST, "/api/instruments/keithley/connect", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &router,
        Method::PUT,
        "/api/instruments/cathode/coefficient",
        Some(json!({ "coefficient": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    app.shutdown().await;
}

#[tokio::test]
async fn second_start_is_a_conflict() {
    let (_bench, app) = bench_app().await;
    let router = create_router(Arc::clone(&app));
    call(&router, Method::POST, "/api/instruments/connect", None).await;

    let (status, _) = call(&router, Method::POST, "/api/test/start", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&router, Method::POST, "/api/test/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
    let (status, _) = call(&router, Method::POST, "/api/stabilization/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, stopped) = call(&router, Method::POST, "/api/test/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["phase"], "stopped");
    app.shutdown().await;
}

#[tokio::test]
async fn device_fault_is_a_bad_gateway() {
    let (bench, app) = bench_app().await;
    let router = create_router(Arc::clone(&app));
    call(&router, Method::POST, "/api/instruments/connect", None).await;
    bench.hv_source.set_failing(true);

    let (status, body) = call(&router, Method::POST, "/api/test/reset-voltage", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "DEVICE_ERROR");
    app.shutdown().await;
}

#[tokio::test]
async fn plot_can_be_cleared() {
    let (_bench, app) = bench_app().await;
    let router = create_router(Arc::clone(&app));

    let (status, ack) = call(&router, Method::DELETE, "/api/plot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ok"], true);
    let (status, plot) = call(&router, Method::GET, "/api/plot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(plot.as_array().unwrap().len() <= 1);
    app.shutdown().await;
}
