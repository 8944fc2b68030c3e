//! Business endpoints reachable over a session.
//!
//! Location and geofence endpoints call into the real-time core; social,
//! marketplace and room endpoints are thin record-store handlers.

use crate::api_geofences::CreateFenceRequest;
use crate::api_location::user_list;
use futures_util::future::{BoxFuture, FutureExt};
use geomesh_bus::EventBus;
use geomesh_channels::{RouterError, RpcCall, RpcError, RpcOutcome, RpcTable};
use geomesh_db::{Filter, Record, RecordStore, StoreError};
use geomesh_geofence::GeofenceEngine;
use geomesh_spatial::SpatialStore;
use geomesh_types::{topics, JsonMap, Location, Point, Presence, RpcMethod};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const POST_KIND: &str = "post";
const LIKE_KIND: &str = "like";
const COMMENT_KIND: &str = "comment";
const ARTICLE_KIND: &str = "article";
const SALE_KIND: &str = "sale";
const ROOM_MEMBER_KIND: &str = "room_member";
const USER_STATUS_KIND: &str = "user_status";

/// Page size for list endpoints.
const LIST_LIMIT: usize = 20;
/// Rows scanned when a list needs filtering the store cannot express.
const SCAN_LIMIT: usize = 500;

/// Everything the session endpoints need.
pub struct RpcContext {
    pub spatial: Arc<SpatialStore>,
    pub geofences: Arc<GeofenceEngine>,
    pub records: Arc<dyn RecordStore>,
    pub bus: EventBus,
}

type Endpoint = fn(Arc<RpcContext>, RpcCall) -> BoxFuture<'static, Result<RpcOutcome, RpcError>>;

/// Builds the session routing table.
///
/// # Errors
///
/// Returns `RouterError::DuplicateRoute` if a route is registered twice.
pub fn rpc_table(ctx: RpcContext) -> Result<RpcTable, RouterError> {
    let ctx = Arc::new(ctx);
    let routes: [(RpcMethod, &str, Endpoint); 14] = [
        (RpcMethod::Post, "/location/update", |c, r| location_update(c, r).boxed()),
        (RpcMethod::Post, "/location/nearby", |c, r| location_nearby(c, r).boxed()),
        (RpcMethod::Post, "/location/polygon", |c, r| location_polygon(c, r).boxed()),
        (RpcMethod::Post, "/presence/update", |c, r| presence_update(c, r).boxed()),
        (RpcMethod::Get, "/geofences", |c, r| list_geofences(c, r).boxed()),
        (RpcMethod::Post, "/geofences", |c, r| create_geofence(c, r).boxed()),
        (RpcMethod::Get, "/posts", |c, r| list_posts(c, r).boxed()),
        (RpcMethod::Post, "/posts", |c, r| create_post(c, r).boxed()),
        (RpcMethod::Post, "/posts/like", |c, r| like_post(c, r).boxed()),
        (RpcMethod::Post, "/posts/comment", |c, r| comment_post(c, r).boxed()),
        (RpcMethod::Get, "/articles", |c, r| list_articles(c, r).boxed()),
        (RpcMethod::Post, "/articles/buy", |c, r| buy_article(c, r).boxed()),
        (RpcMethod::Post, "/rooms/join", |c, r| join_room(c, r).boxed()),
        (RpcMethod::Post, "/rooms/leave", |c, r| leave_room(c, r).boxed()),
    ];

    routes
        .into_iter()
        .fold(RpcTable::builder(), |builder, (method, endpoint, handler)| {
            let ctx = Arc::clone(&ctx);
            builder.route(method, endpoint, move |call| handler(Arc::clone(&ctx), call))
        })
        .build()
}

// ----- helpers -----

fn parse<T: DeserializeOwned>(call: &RpcCall) -> Result<T, RpcError> {
    serde_json::from_value(Value::Object(call.body()))
        .map_err(|e| RpcError::bad_request(format!("invalid request body: {e}")))
}

fn object(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Runs a record-store call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, RpcError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "record store call failed");
            Err(RpcError::internal("storage error"))
        }
        Err(e) => {
            tracing::error!(error = %e, "record store task failed");
            Err(RpcError::internal("storage error"))
        }
    }
}

/// A record flattened for clients: `{id, created_at, updated_at, ...fields}`.
fn record_json(record: &Record) -> Value {
    let mut map = record.fields.clone();
    map.insert("id".into(), json!(record.id));
    map.insert("created_at".into(), json!(record.created_at));
    map.insert("updated_at".into(), json!(record.updated_at));
    Value::Object(map)
}

fn field_i64(fields: &JsonMap, key: &str) -> i64 {
    fields.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn required(value: Option<String>, name: &str) -> Result<String, RpcError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RpcError::bad_request(format!("{name} required")))
}

/// Accepts `{lat, lng, ...}` or `{point: {lat, lng}, ...}`.
fn parse_location(value: Value) -> Result<Location, RpcError> {
    let mut map = match value {
        Value::Object(map) => map,
        _ => return Err(RpcError::bad_request("invalid location data")),
    };
    if let Some(Value::Object(point)) = map.remove("point") {
        for key in ["lat", "lng"] {
            if let Some(v) = point.get(key) {
                map.insert(key.to_string(), v.clone());
            }
        }
    }
    let mut location: Location = serde_json::from_value(Value::Object(map))
        .map_err(|e| RpcError::bad_request(format!("invalid location data: {e}")))?;
    if !location.point.is_valid() {
        return Err(RpcError::bad_request("coordinates out of range"));
    }
    location.timestamp = Utc::now();
    Ok(location)
}

fn parse_presence(raw: Option<&str>) -> Result<Presence, RpcError> {
    match raw {
        None | Some("") => Ok(Presence::Online),
        Some(s) => s.parse().map_err(|e| RpcError::bad_request(format!("{e}"))),
    }
}

/// Increments a counter field on `kind/id` if the record exists and returns
/// the record's owner.
fn bump_counter(
    store: &dyn RecordStore,
    kind: &str,
    id: &str,
    counter: &str,
) -> Result<Option<String>, StoreError> {
    let Some(record) = store.find_by_id(kind, id)? else {
        return Ok(None);
    };
    let mut fields = record.fields;
    let next = field_i64(&fields, counter) + 1;
    fields.insert(counter.to_string(), json!(next));
    store.save(kind, id, &fields)?;
    Ok(fields.get("user").and_then(Value::as_str).map(str::to_string))
}

/// Tells a post's author about activity by someone else.
fn notify_owner(bus: &EventBus, owner: Option<String>, actor: &str, kind: &str, post_id: &str) {
    let Some(owner) = owner.filter(|o| o != actor) else {
        return;
    };
    bus.publish_json(
        topics::NOTIFICATIONS,
        &json!({
            "type": kind,
            "user_id": owner,
            "post_id": post_id,
            "by": actor,
        }),
    );
}

// ----- location -----

#[derive(Deserialize)]
struct LocationUpdateBody {
    location: Value,
    presence: Option<String>,
}

async fn location_update(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: LocationUpdateBody = parse(&call)?;
    let location = parse_location(body.location)?;
    let presence = parse_presence(body.presence.as_deref())?;
    ctx.spatial.update_location(&call.user_id, location, presence);
    Ok(RpcOutcome::ok(object(json!({
        "success": true,
        "user_id": call.user_id,
    }))))
}

#[derive(Deserialize)]
struct NearbyBody {
    point: Point,
    #[serde(default)]
    radius: f64,
}

async fn location_nearby(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: NearbyBody = parse(&call)?;
    if !body.radius.is_finite() || body.radius < 0.0 {
        return Err(RpcError::bad_request("invalid radius"));
    }
    let users = ctx
        .spatial
        .find_nearby(body.point, body.radius, Some(&call.user_id));
    Ok(RpcOutcome::ok(object(user_list(&users))))
}

#[derive(Deserialize)]
struct PolygonBody {
    polygon: Vec<Point>,
}

async fn location_polygon(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: PolygonBody = parse(&call)?;
    let users = ctx.spatial.find_in_polygon(&body.polygon);
    Ok(RpcOutcome::ok(object(user_list(&users))))
}

#[derive(Deserialize)]
struct PresenceBody {
    presence: Option<String>,
}

async fn presence_update(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: PresenceBody = parse(&call)?;
    let presence = parse_presence(body.presence.as_deref())?;
    let located = ctx.spatial.set_presence(&call.user_id, presence).is_some();

    let store = Arc::clone(&ctx.records);
    let user_id = call.user_id.clone();
    let fields = object(json!({
        "presence": presence,
        "last_seen": Utc::now(),
    }));
    blocking(move || store.save(USER_STATUS_KIND, &user_id, &fields)).await?;

    Ok(RpcOutcome::ok(object(json!({
        "success": true,
        "presence": presence,
        "located": located,
    }))))
}

// ----- geofences -----

async fn list_geofences(ctx: Arc<RpcContext>, _call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let fences = ctx.geofences.list_fences();
    Ok(RpcOutcome::ok(object(json!({
        "count": fences.len(),
        "fences": fences,
    }))))
}

async fn create_geofence(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let request: CreateFenceRequest = parse(&call)?;
    if request.name.trim().is_empty() {
        return Err(RpcError::bad_request("name required"));
    }
    if !request.geometry.is_well_formed() {
        return Err(RpcError::bad_request("invalid geometry"));
    }
    let fence = ctx.geofences.add_fence(request.into_fence(&call.user_id));
    Ok(RpcOutcome::created(object(json!({
        "success": true,
        "fence": fence,
    }))))
}

// ----- posts -----

async fn list_posts(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let filter = match call.query("user") {
        Some(author) if !author.is_empty() => Filter::new().eq("user", author),
        _ => Filter::new().eq("is_public", true),
    };
    let store = Arc::clone(&ctx.records);
    let posts = blocking(move || store.find_by_filter(POST_KIND, &filter, LIST_LIMIT)).await?;
    Ok(RpcOutcome::ok(object(json!({
        "count": posts.len(),
        "posts": posts.iter().map(record_json).collect::<Vec<_>>(),
    }))))
}

#[derive(Deserialize)]
struct CreatePostBody {
    #[serde(rename = "type", default = "default_post_type")]
    post_type: String,
    #[serde(default)]
    content: Value,
    #[serde(default = "default_public")]
    is_public: bool,
}

fn default_post_type() -> String {
    "html".to_string()
}

fn default_public() -> bool {
    true
}

async fn create_post(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: CreatePostBody = parse(&call)?;
    let post_id = Uuid::new_v4().to_string();
    let fields = object(json!({
        "user": call.user_id,
        "type": body.post_type,
        "content": body.content,
        "is_public": body.is_public,
        "likes_count": 0,
        "comments_count": 0,
    }));

    let store = Arc::clone(&ctx.records);
    let id = post_id.clone();
    let record = blocking(move || store.save(POST_KIND, &id, &fields)).await?;

    ctx.bus.publish_json(
        topics::POST_EVENTS,
        &json!({
            "type": "new_post",
            "post_id": post_id,
            "user_id": call.user_id,
        }),
    );

    Ok(RpcOutcome::created(object(json!({
        "success": true,
        "post_id": post_id,
        "post": record_json(&record),
    }))))
}

#[derive(Deserialize)]
struct LikeBody {
    post_id: Option<String>,
    reaction: Option<String>,
}

async fn like_post(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: LikeBody = parse(&call)?;
    let post_id = required(body.post_id, "post_id")?;
    let reaction = body.reaction.unwrap_or_else(|| "like".to_string());
    let like_id = Uuid::new_v4().to_string();

    let store = Arc::clone(&ctx.records);
    let (user, post, id) = (call.user_id.clone(), post_id.clone(), like_id.clone());
    let owner = blocking(move || {
        let fields = object(json!({"user": user, "post": post, "reaction": reaction}));
        store.save(LIKE_KIND, &id, &fields)?;
        bump_counter(store.as_ref(), POST_KIND, &post, "likes_count")
    })
    .await?;

    notify_owner(&ctx.bus, owner, &call.user_id, "post_liked", &post_id);
    Ok(RpcOutcome::ok(object(json!({
        "success": true,
        "like_id": like_id,
    }))))
}

#[derive(Deserialize)]
struct CommentBody {
    post_id: Option<String>,
    content: Option<String>,
}

async fn comment_post(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: CommentBody = parse(&call)?;
    let (post_id, content) = match (
        body.post_id.filter(|v| !v.is_empty()),
        body.content.filter(|v| !v.is_empty()),
    ) {
        (Some(p), Some(c)) => (p, c),
        _ => return Err(RpcError::bad_request("post_id and content required")),
    };
    let comment_id = Uuid::new_v4().to_string();

    let store = Arc::clone(&ctx.records);
    let (user, post, id) = (call.user_id.clone(), post_id.clone(), comment_id.clone());
    let owner = blocking(move || {
        let fields = object(json!({"user": user, "post": post, "content": content}));
        store.save(COMMENT_KIND, &id, &fields)?;
        bump_counter(store.as_ref(), POST_KIND, &post, "comments_count")
    })
    .await?;

    notify_owner(&ctx.bus, owner, &call.user_id, "post_commented", &post_id);
    Ok(RpcOutcome::created(object(json!({
        "success": true,
        "comment_id": comment_id,
    }))))
}

// ----- articles -----

async fn list_articles(ctx: Arc<RpcContext>, _call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let store = Arc::clone(&ctx.records);
    let rows = blocking(move || store.find_by_filter(ARTICLE_KIND, &Filter::new(), SCAN_LIMIT)).await?;
    let in_stock: Vec<Value> = rows
        .iter()
        .filter(|r| field_i64(&r.fields, "quantity") > 0)
        .take(LIST_LIMIT)
        .map(record_json)
        .collect();
    Ok(RpcOutcome::ok(object(json!({
        "count": in_stock.len(),
        "articles": in_stock,
    }))))
}

#[derive(Deserialize)]
struct BuyBody {
    article_id: Option<String>,
}

enum Purchase {
    Missing,
    OutOfStock,
    Done { sale_id: String, amount: f64 },
}

async fn buy_article(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: BuyBody = parse(&call)?;
    let article_id = required(body.article_id, "article_id")?;

    let store = Arc::clone(&ctx.records);
    let user = call.user_id.clone();
    let outcome = blocking(move || {
        let Some(article) = store.find_by_id(ARTICLE_KIND, &article_id)? else {
            return Ok(Purchase::Missing);
        };
        let mut fields = article.fields;
        let quantity = field_i64(&fields, "quantity");
        if quantity <= 0 {
            return Ok(Purchase::OutOfStock);
        }
        let amount = fields.get("price").and_then(Value::as_f64).unwrap_or(0.0);

        let sale_id = Uuid::new_v4().to_string();
        let sale = object(json!({
            "article": article_id,
            "amount": amount,
            "status": "pending",
            "user": user,
        }));
        store.save(SALE_KIND, &sale_id, &sale)?;

        fields.insert("quantity".into(), json!(quantity - 1));
        store.save(ARTICLE_KIND, &article_id, &fields)?;
        Ok(Purchase::Done { sale_id, amount })
    })
    .await?;

    match outcome {
        Purchase::Missing => Err(RpcError::not_found("article not found")),
        Purchase::OutOfStock => Err(RpcError::bad_request("out of stock")),
        Purchase::Done { sale_id, amount } => Ok(RpcOutcome::ok(object(json!({
            "success": true,
            "sale_id": sale_id,
            "amount": amount,
        })))),
    }
}

// ----- rooms -----

#[derive(Deserialize)]
struct RoomBody {
    room_id: Option<String>,
}

fn membership_id(room_id: &str, user_id: &str) -> String {
    format!("{room_id}:{user_id}")
}

async fn join_room(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: RoomBody = parse(&call)?;
    let room_id = required(body.room_id, "room_id")?;

    let store = Arc::clone(&ctx.records);
    let id = membership_id(&room_id, &call.user_id);
    let fields = object(json!({"room": room_id, "user": call.user_id}));
    blocking(move || store.save(ROOM_MEMBER_KIND, &id, &fields)).await?;

    Ok(RpcOutcome::ok(object(json!({
        "success": true,
        "room_id": room_id,
        "message": "Joined room",
    }))))
}

async fn leave_room(ctx: Arc<RpcContext>, call: RpcCall) -> Result<RpcOutcome, RpcError> {
    let body: RoomBody = parse(&call)?;
    let room_id = required(body.room_id, "room_id")?;

    let store = Arc::clone(&ctx.records);
    let id = membership_id(&room_id, &call.user_id);
    let removed = blocking(move || store.delete(ROOM_MEMBER_KIND, &id)).await?;
    if !removed {
        return Err(RpcError::not_found("not a member of this room"));
    }

    Ok(RpcOutcome::ok(object(json!({
        "success": true,
        "room_id": room_id,
        "message": "Left room",
    }))))
}
