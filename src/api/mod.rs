mod base;
mod fleet;
mod subscribers;

use std::borrow::Cow;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use base::AboutResponse;
pub use fleet::{ResyncResponse, RetireResponse};
pub use subscribers::{DeviceRequest, DeviceResponse};

use crate::engine::EngineHandle;
use crate::error::Result;

/// Retiring a node may wait out the running cycles' grace period
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the administrative API on top of a running engine
pub async fn api(engine: EngineHandle) -> Result<Router> {
    let api = Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        // Fleet
        .route(paths::fleet::NODES, routing::get(fleet::list_nodes))
        .route(paths::fleet::RESYNC, routing::post(fleet::resync_node))
        .route(paths::fleet::RETIRE, routing::post(fleet::retire_node))
        .route(paths::fleet::EVENTS, routing::get(fleet::list_events))
        // Usage and the device-registration feed
        .route(paths::subscribers::USAGE, routing::get(subscribers::get_usage))
        .route(
            paths::subscribers::USAGE_RESET,
            routing::post(subscribers::reset_usage),
        )
        .route(
            paths::subscribers::DEVICES,
            routing::post(subscribers::register_device),
        )
        .route(
            paths::subscribers::DEVICE,
            routing::delete(subscribers::unregister_device),
        )
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(REQUEST_TIMEOUT),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(engine);

    Ok(api)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
