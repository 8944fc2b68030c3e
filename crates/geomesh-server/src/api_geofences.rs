//! Geofence CRUD handlers.

use crate::middleware::UserContext;
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::Json,
};
use geomesh_types::{ActionKind, FenceUpdate, GeoFence, Geometry, JsonMap, TriggerType};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Body of a fence creation request. The id and owner are assigned here.
#[derive(Debug, Deserialize)]
pub struct CreateFenceRequest {
    pub name: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub actions: Vec<ActionKind>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl CreateFenceRequest {
    pub fn into_fence(self, owner_id: &str) -> GeoFence {
        GeoFence {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            geometry: self.geometry,
            trigger_type: self.trigger_type,
            actions: self.actions,
            metadata: self.metadata,
            owner_id: owner_id.to_string(),
            is_active: true,
        }
    }
}

fn fence_json(fence: &GeoFence) -> Result<Value, StatusCode> {
    serde_json::to_value(fence).map_err(|e| {
        tracing::error!(fence_id = %fence.id, error = %e, "failed to serialize geofence");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Handler for `POST /api/geofences`.
pub async fn create_fence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
    Json(payload): Json<CreateFenceRequest>,
) -> Result<Json<Value>, StatusCode> {
    if payload.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !payload.geometry.is_well_formed() {
        tracing::debug!(user_id = %user_id, kind = payload.geometry.kind(), "rejecting malformed geometry");
        return Err(StatusCode::BAD_REQUEST);
    }
    let fence = state.geofences.add_fence(payload.into_fence(&user_id));
    Ok(Json(fence_json(&fence)?))
}

/// Handler for `GET /api/geofences`.
pub async fn list_fences_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let fences = state.geofences.list_fences();
    Ok(Json(json!({
        "count": fences.len(),
        "fences": fences,
    })))
}

/// Handler for `GET /api/geofences/{fenceId}`.
pub async fn get_fence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fence_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let fence = state
        .geofences
        .get_fence(&fence_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(fence_json(&fence)?))
}

/// Handler for `PATCH /api/geofences/{fenceId}`.
pub async fn update_fence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fence_id): Path<String>,
    Json(update): Json<FenceUpdate>,
) -> Result<Json<Value>, StatusCode> {
    if update
        .geometry
        .as_ref()
        .is_some_and(|g| !g.is_well_formed())
    {
        return Err(StatusCode::BAD_REQUEST);
    }
    let fence = state
        .geofences
        .update_fence(&fence_id, update)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(fence_json(&fence)?))
}

/// Handler for `DELETE /api/geofences/{fenceId}`.
pub async fn delete_fence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fence_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .geofences
        .remove_fence(&fence_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "success": true,
        "fence_id": fence_id,
    })))
}
