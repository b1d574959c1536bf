//! Request handlers

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::ApiResult;
use super::AppState;
use crate::app::ConnectOutcome;
use crate::config::store::ConfigStore;
use crate::controller::ControllerState;
use crate::instrument::InstrumentSlot;
use crate::params::{StabilizationParameters, TestParameters};
use crate::sequencer::SequencerState;
use crate::telemetry::{PlotSample, TelemetrySnapshot, TelemetryStats};

/// Plain acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    /// Always true
    pub ok: bool,
}

fn ack() -> Json<Ack> {
    Json(Ack { ok: true })
}

/// Optional body of a connect request
#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    /// Port to bind; the stored binding is used when absent
    pub port: Option<String>,
}

/// Body of a coefficient update
#[derive(Debug, Deserialize)]
pub struct CoefficientRequest {
    /// New scaling coefficient
    pub coefficient: f64,
}

fn slot(name: &str) -> ApiResult<InstrumentSlot> {
    Ok(name.parse()?)
}

// -- State and chart ---------------------------------------------------------

/// Current bench snapshot
pub async fn get_state(State(state): State<AppState>) -> Json<TelemetrySnapshot> {
    Json(state.app.snapshot())
}

/// Chart history
pub async fn get_plot(State(state): State<AppState>) -> Json<Vec<PlotSample>> {
    Json(state.app.plot())
}

/// Clear the chart history
pub async fn clear_plot(State(state): State<AppState>) -> Json<Ack> {
    state.app.clear_plot();
    ack()
}

/// Telemetry hub counters
pub async fn telemetry_stats(State(state): State<AppState>) -> Json<TelemetryStats> {
    Json(state.app.telemetry().stats())
}

/// Live telemetry frames
pub async fn stream_telemetry(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let frames = state
        .app
        .telemetry()
        .subscribe()
        .map(|frame| Event::default().event("telemetry").json_data(&frame));

    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

// -- Instruments -------------------------------------------------------------

/// Connect every slot with a stored binding
pub async fn connect_all(State(state): State<AppState>) -> Json<Vec<ConnectOutcome>> {
    Json(state.app.connect_all().await)
}

/// Disconnect every connected slot
pub async fn disconnect_all(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.app.disconnect_all().await?;
    Ok(ack())
}

/// Connect one slot
pub async fn connect(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<ConnectRequest>>,
) -> ApiResult<Json<Ack>> {
    let port = body.and_then(|Json(request)| request.port);
    state.app.connect(slot(&name)?, port).await?;
    Ok(ack())
}

/// Disconnect one slot
pub async fn disconnect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Ack>> {
    state.app.disconnect(slot(&name)?).await?;
    Ok(ack())
}

/// Change one slot's coefficient
pub async fn set_coefficient(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CoefficientRequest>,
) -> ApiResult<Json<Ack>> {
    state
        .app
        .set_coefficient(slot(&name)?, request.coefficient)
        .await?;
    Ok(ack())
}

// -- Parameters --------------------------------------------------------------

/// Stored ramp parameters
pub async fn get_test_params(State(state): State<AppState>) -> Json<TestParameters> {
    Json(state.app.store().get_test_params())
}

/// Replace the ramp parameters
pub async fn set_test_params(
    State(state): State<AppState>,
    Json(params): Json<TestParameters>,
) -> ApiResult<Json<TestParameters>> {
    state.app.set_test_params(params.clone())?;
    Ok(Json(params))
}

/// Stored stabilization parameters
pub async fn get_stabilization_params(
    State(state): State<AppState>,
) -> Json<StabilizationParameters> {
    Json(state.app.store().get_stabilization_params())
}

/// Replace the stabilization parameters
pub async fn set_stabilization_params(
    State(state): State<AppState>,
    Json(params): Json<StabilizationParameters>,
) -> ApiResult<Json<StabilizationParameters>> {
    state.app.set_stabilization_params(params.clone())?;
    Ok(Json(params))
}

// -- Sessions ----------------------------------------------------------------

/// Start a single-pass ramp
pub async fn start_test(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.app.start_test().await?;
    Ok(ack())
}

/// Start a cyclic ramp
pub async fn start_cycle_test(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.app.start_cycle_test().await?;
    Ok(ack())
}

/// Stop the ramp
pub async fn stop_test(State(state): State<AppState>) -> ApiResult<Json<SequencerState>> {
    Ok(Json(state.app.stop_test().await?))
}

/// Drive the HV output to the safe voltage
pub async fn reset_voltage(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.app.reset_voltage().await?;
    Ok(ack())
}

/// Start stabilization
pub async fn start_stabilization(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.app.start_stabilization().await?;
    Ok(ack())
}

/// Stop stabilization
pub async fn stop_stabilization(
    State(state): State<AppState>,
) -> ApiResult<Json<ControllerState>> {
    Ok(Json(state.app.stop_stabilization().await?))
}
