use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::engine::EngineHandle;
use crate::error::Result;
use crate::model::{LimitKind, SubscriberId, UsageTotal};

#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceResponse {
    pub usage: UsageTotal,
    /// Limit enforced because of this registration
    pub enforced: Option<LimitKind>,
}

#[instrument(skip(engine), level = "debug")]
pub async fn get_usage(
    Path(subscriber_id): Path<SubscriberId>,
    State(engine): State<EngineHandle>,
) -> Result<Json<UsageTotal>> {
    engine.usage(&subscriber_id).await.map(Json)
}

#[instrument(skip(engine), level = "debug")]
pub async fn reset_usage(
    Path(subscriber_id): Path<SubscriberId>,
    State(engine): State<EngineHandle>,
) -> Result<Json<UsageTotal>> {
    engine.reset_usage(&subscriber_id).await.map(Json)
}

#[instrument(skip(engine), level = "debug")]
pub async fn register_device(
    Path(subscriber_id): Path<SubscriberId>,
    State(engine): State<EngineHandle>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<DeviceResponse>> {
    let update = engine
        .register_device(&subscriber_id, &request.device_id)
        .await?;
    Ok(Json(DeviceResponse {
        usage: update.usage,
        enforced: update.enforced,
    }))
}

#[instrument(skip(engine), level = "debug")]
pub async fn unregister_device(
    Path((subscriber_id, device_id)): Path<(SubscriberId, String)>,
    State(engine): State<EngineHandle>,
) -> Result<Json<UsageTotal>> {
    engine
        .unregister_device(&subscriber_id, &device_id)
        .await
        .map(Json)
}
