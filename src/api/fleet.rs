use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::engine::{EngineHandle, NodeStatus};
use crate::error::Result;
use crate::events::Event;
use crate::model::{HealthState, NodeId};

pub const DEFAULT_EVENT_LIMIT: usize = 100;
pub const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Debug, Deserialize, Serialize)]
pub struct ResyncResponse {
    pub node_id: NodeId,
    pub queued: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetireResponse {
    pub node_id: NodeId,
    /// State the node was in; absent when it was already retired
    pub previous_state: Option<HealthState>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[instrument(skip(engine), level = "debug")]
pub async fn list_nodes(State(engine): State<EngineHandle>) -> Result<Json<Vec<NodeStatus>>> {
    engine.fleet_status().await.map(Json)
}

#[instrument(skip(engine), level = "debug")]
pub async fn resync_node(
    Path(node_id): Path<NodeId>,
    State(engine): State<EngineHandle>,
) -> Result<(StatusCode, Json<ResyncResponse>)> {
    engine.force_resync(node_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ResyncResponse {
            node_id,
            queued: true,
        }),
    ))
}

#[instrument(skip(engine), level = "debug")]
pub async fn retire_node(
    Path(node_id): Path<NodeId>,
    State(engine): State<EngineHandle>,
) -> Result<Json<RetireResponse>> {
    let previous_state = engine.retire_node(node_id).await?;
    Ok(Json(RetireResponse {
        node_id,
        previous_state,
    }))
}

#[instrument(skip(engine), level = "debug")]
pub async fn list_events(
    Query(query): Query<EventsQuery>,
    State(engine): State<EngineHandle>,
) -> Result<Json<Vec<Event>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    engine.recent_events(limit).await.map(Json)
}
