//! Conversion between [`GeoFence`] and stored records.
//!
//! Geometry, actions and metadata are stored as JSON text so that a fence
//! written by an older build with an unknown shape still loads.

use geomesh_db::Record;
use geomesh_types::{ActionKind, GeoFence, Geometry, JsonMap, TriggerType};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub(crate) const FENCE_KIND: &str = "geofence";

pub(crate) fn fence_fields(fence: &GeoFence) -> JsonMap {
    let text = |value: Result<String, serde_json::Error>| value.unwrap_or_else(|_| "null".into());

    let mut fields = JsonMap::new();
    fields.insert("name".into(), json!(fence.name));
    fields.insert(
        "geometry".into(),
        json!(text(serde_json::to_string(&fence.geometry))),
    );
    fields.insert("trigger_type".into(), json!(fence.trigger_type));
    fields.insert(
        "actions".into(),
        json!(text(serde_json::to_string(&fence.actions))),
    );
    fields.insert(
        "metadata".into(),
        json!(text(serde_json::to_string(&fence.metadata))),
    );
    fields.insert("owner_id".into(), json!(fence.owner_id));
    fields.insert("is_active".into(), json!(fence.is_active));
    fields
}

/// Rebuilds a fence from its record. Unparsable parts fall back to
/// [`Geometry::Unsupported`], no actions and empty metadata.
pub(crate) fn fence_from_record(record: &Record) -> GeoFence {
    let fields = &record.fields;

    let geometry = match decode_field::<Geometry>(fields.get("geometry")) {
        Some(geometry) => geometry,
        None => {
            tracing::warn!(fence_id = %record.id, "stored geofence geometry unreadable, loading as unsupported");
            Geometry::Unsupported
        }
    };

    GeoFence {
        id: record.id.clone(),
        name: fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        geometry,
        trigger_type: decode_field::<TriggerType>(fields.get("trigger_type")).unwrap_or_default(),
        actions: decode_field::<Vec<ActionKind>>(fields.get("actions")).unwrap_or_default(),
        metadata: decode_field::<JsonMap>(fields.get("metadata")).unwrap_or_default(),
        owner_id: fields
            .get("owner_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        is_active: fields
            .get("is_active")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    }
}

/// Decodes a field that is either JSON text or an inline JSON value.
fn decode_field<T: DeserializeOwned>(value: Option<&Value>) -> Option<T> {
    match value? {
        Value::String(text) => serde_json::from_str(text)
            .ok()
            .or_else(|| serde_json::from_value(Value::String(text.clone())).ok()),
        other => serde_json::from_value(other.clone()).ok(),
    }
}
