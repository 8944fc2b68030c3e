//! geomesh server library logic.

pub mod api_geofences;
pub mod api_location;
pub mod api_rpc;
pub mod api_session;
pub mod api_sse;
pub mod config;
pub mod fanout;
pub mod middleware;
pub mod ws_transport;

use api_rpc::{rpc_table, RpcContext};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::RealtimeConfig;
use geomesh_bus::EventBus;
use geomesh_channels::{ChannelRouter, RouterError, RouterOptions};
use geomesh_db::{DbPool, RecordStore, RecordWriter, SqliteRecordStore, StoreError};
use geomesh_geofence::GeofenceEngine;
use geomesh_spatial::SpatialStore;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use ws_transport::WsNegotiator;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Live user locations and presence.
    pub spatial: Arc<SpatialStore>,
    pub geofences: Arc<GeofenceEngine>,
    pub bus: EventBus,
    /// Push channels and sessions.
    pub router: ChannelRouter,
    /// Matches WebSocket upgrades to outstanding session offers.
    pub negotiator: Arc<WsNegotiator>,
    pub records: Arc<dyn RecordStore>,
    /// Ordered background writes for the spatial store and geofence engine.
    pub writer: RecordWriter,
    /// Cancelled once at shutdown; streams and background tasks watch it.
    pub shutdown: CancellationToken,
}

/// Errors that prevent the application state from being assembled.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to restore geofences: {0}")]
    Store(#[from] StoreError),
    #[error("invalid session route table: {0}")]
    Routes(#[from] RouterError),
    #[error("failed to start the record writer: {0}")]
    Writer(#[from] std::io::Error),
}

impl AppState {
    /// Wires the real-time core on top of a migrated pool and restores the
    /// persisted geofences.
    ///
    /// # Errors
    ///
    /// Returns `StartupError` if stored fences cannot be read, the writer
    /// thread cannot start, or the session route table is inconsistent.
    pub fn build(
        pool: DbPool,
        realtime: &RealtimeConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, StartupError> {
        let bus = EventBus::new(realtime.bus_queue_capacity);
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
        let writer = RecordWriter::spawn(Arc::clone(&records))?;

        let spatial = Arc::new(
            SpatialStore::new(bus.clone())
                .with_persistence(writer.clone())
                .with_staleness(realtime.staleness()),
        );
        let geofences =
            Arc::new(GeofenceEngine::new(bus.clone()).with_persistence(writer.clone()));
        geofences.restore()?;
        spatial.add_listener(geofences.clone());

        let table = rpc_table(RpcContext {
            spatial: Arc::clone(&spatial),
            geofences: Arc::clone(&geofences),
            records: Arc::clone(&records),
            bus: bus.clone(),
        })?;

        let negotiator = Arc::new(WsNegotiator::new(realtime.session_queue_capacity));
        let router = ChannelRouter::new(
            negotiator.clone(),
            Arc::new(table),
            RouterOptions {
                push_capacity: realtime.push_queue_capacity,
                presence: Some(Arc::clone(&spatial)),
                shutdown: shutdown.child_token(),
            },
        );

        Ok(Self {
            spatial,
            geofences,
            bus,
            router,
            negotiator,
            records,
            writer,
            shutdown,
        })
    }
}

/// Starts the tasks that run alongside the HTTP server.
pub fn start_background(state: &AppState) -> JoinHandle<()> {
    fanout::spawn_fanout(&state.bus, state.router.clone(), state.shutdown.clone())
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
///
/// The caller keeps its own handle on `state` for shutdown.
pub fn app(state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/location/update",
            post(api_location::update_location_handler),
        )
        .route(
            "/api/location/user/{userId}",
            get(api_location::get_location_handler),
        )
        .route("/api/location/nearby", post(api_location::nearby_handler))
        .route("/api/location/polygon", post(api_location::polygon_handler))
        .route(
            "/api/location/presence",
            get(api_location::presence_handler),
        )
        .route(
            "/api/location/notify-zone",
            post(api_location::notify_zone_handler),
        )
        .route(
            "/api/geofences",
            post(api_geofences::create_fence_handler).get(api_geofences::list_fences_handler),
        )
        .route(
            "/api/geofences/{fenceId}",
            get(api_geofences::get_fence_handler)
                .patch(api_geofences::update_fence_handler)
                .delete(api_geofences::delete_fence_handler),
        )
        .route("/api/user/sse", get(api_sse::user_stream_handler))
        .route(
            "/api/user/session/connect",
            post(api_session::connect_handler),
        )
        .route(
            "/api/user/session",
            get(api_session::status_handler).delete(api_session::disconnect_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    // The offer id in the query string identifies the caller here.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/events/{topic}", get(api_sse::topic_stream_handler))
        .route(
            ws_transport::SESSION_WS_PATH,
            get(api_session::ws_answer_handler),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}
