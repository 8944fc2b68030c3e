//! Location, presence and zone notification handlers.

use crate::middleware::UserContext;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use geomesh_spatial::ZoneNotification;
use geomesh_types::{Location, Point, Presence, UserPresence};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct UpdateLocationRequest {
    pub location: Location,
    #[serde(default)]
    pub presence: Option<Presence>,
}

#[derive(Debug, Deserialize)]
pub struct NearbyRequest {
    pub point: Point,
    /// Meters.
    pub radius: f64,
}

#[derive(Debug, Deserialize)]
pub struct PolygonRequest {
    pub polygon: Vec<Point>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceParams {
    pub presence: Option<String>,
}

/// Compact view of a presence record used in query results.
pub(crate) fn user_summary(user: &UserPresence) -> Value {
    json!({
        "user_id": user.user_id,
        "location": user.location,
        "presence": user.presence,
        "updated_at": user.updated_at,
    })
}

pub(crate) fn user_list(users: &[UserPresence]) -> Value {
    json!({
        "count": users.len(),
        "users": users.iter().map(user_summary).collect::<Vec<_>>(),
    })
}

/// Handler for `POST /api/location/update`.
///
/// The sample is stamped with the server's clock.
pub async fn update_location_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Value>, StatusCode> {
    let mut location = payload.location;
    if !location.point.is_valid() {
        return Err(StatusCode::BAD_REQUEST);
    }
    location.timestamp = Utc::now();
    let presence = payload.presence.unwrap_or_default();

    let record = state.spatial.update_location(&user_id, location, presence);
    Ok(Json(json!({
        "success": true,
        "user_id": record.user_id,
        "location": record.location,
        "presence": record.presence,
    })))
}

/// Handler for `GET /api/location/user/{userId}`.
pub async fn get_location_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserPresence>, StatusCode> {
    state
        .spatial
        .get_location(&user_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Handler for `POST /api/location/nearby`. The caller is excluded.
pub async fn nearby_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
    Json(payload): Json<NearbyRequest>,
) -> Result<Json<Value>, StatusCode> {
    if !payload.radius.is_finite() || payload.radius < 0.0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let users = state
        .spatial
        .find_nearby(payload.point, payload.radius, Some(&user_id));
    Ok(Json(user_list(&users)))
}

/// Handler for `POST /api/location/polygon`.
pub async fn polygon_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<PolygonRequest>,
) -> Result<Json<Value>, StatusCode> {
    let users = state.spatial.find_in_polygon(&payload.polygon);
    Ok(Json(user_list(&users)))
}

/// Handler for `GET /api/location/presence?presence=online`.
pub async fn presence_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<PresenceParams>,
) -> Result<Json<Value>, StatusCode> {
    let presence = match params.presence.as_deref() {
        None | Some("") => Presence::Online,
        Some(raw) => raw.parse().map_err(|_| StatusCode::BAD_REQUEST)?,
    };
    let users = state.spatial.get_by_presence(presence);
    let mut body = user_list(&users);
    body["presence"] = json!(presence);
    Ok(Json(body))
}

/// Handler for `POST /api/location/notify-zone`.
pub async fn notify_zone_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
    Json(payload): Json<ZoneNotification>,
) -> Result<Json<Value>, StatusCode> {
    let zone = payload.zone().ok_or(StatusCode::BAD_REQUEST)?;
    let notified = state
        .spatial
        .notify_zone(&zone, &payload.title, &payload.message, &payload.data);
    tracing::info!(user_id = %user_id, notified, "zone notification requested");
    Ok(Json(json!({
        "success": true,
        "notified_count": notified,
    })))
}
