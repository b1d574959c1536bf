//! HTTP control surface for remote browsers.
//!
//! Every route maps onto one [`HvApp`] operation. Errors come back as JSON with the
//! status codes of [`error::ApiError`]; live telemetry is served as server-sent
//! events.

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::HvApp;
use crate::error::AppResult;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// The running bench
    pub app: Arc<HvApp>,
}

/// Builds the router with trace and CORS layers.
pub fn create_router(app: Arc<HvApp>) -> Router {
    let api_routes = Router::new()
        // State and chart
        .route("/state", get(handlers::get_state))
        .route("/plot", get(handlers::get_plot).delete(handlers::clear_plot))
        .route("/telemetry/stats", get(handlers::telemetry_stats))
        .route("/events", get(handlers::stream_telemetry))
        // Instruments
        .route("/instruments/connect", post(handlers::connect_all))
        .route("/instruments/disconnect", post(handlers::disconnect_all))
        .route("/instruments/:slot/connect", post(handlers::connect))
        .route("/instruments/:slot/disconnect", post(handlers::disconnect))
        .route("/instruments/:slot/coefficient", put(handlers::set_coefficient))
        // Parameters
        .route(
            "/params/test",
            get(handlers::get_test_params).put(handlers::set_test_params),
        )
        .route(
            "/params/stabilization",
            get(handlers::get_stabilization_params).put(handlers::set_stabilization_params),
        )
        // Ramp tests
        .route("/test/start", post(handlers::start_test))
        .route("/test/cycle", post(handlers::start_cycle_test))
        .route("/test/stop", post(handlers::stop_test))
        .route("/test/reset-voltage", post(handlers::reset_voltage))
        // Stabilization
        .route("/stabilization/start", post(handlers::start_stabilization))
        .route("/stabilization/stop", post(handlers::stop_stabilization));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState { app })
}

/// Serves the router on `bind` until `shutdown` resolves.
pub async fn serve(
    app: Arc<HvApp>,
    bind: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP control surface listening");
    axum::serve(listener, create_router(app))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
