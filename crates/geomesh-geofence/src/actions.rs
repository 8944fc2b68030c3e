//! Fence actions. Each [`ActionKind`] maps to one publisher function.

use geomesh_bus::EventBus;
use geomesh_types::{topics, ActionKind, GeoEvent, GeoEventKind};
use serde_json::{json, Value};

type ActionHandler = fn(&EventBus, &GeoEvent);

fn handler_for(kind: ActionKind) -> Option<ActionHandler> {
    match kind {
        ActionKind::Notification => Some(send_notification),
        ActionKind::Chat => Some(send_chat_invite),
        ActionKind::Ads => Some(send_ad),
        ActionKind::Call => Some(send_call_invite),
        ActionKind::Unknown => None,
    }
}

/// Runs every action of the event's fence in listed order.
///
/// Unknown actions are logged and skipped.
pub(crate) fn execute_all(bus: &EventBus, event: &GeoEvent) {
    for (index, action) in event.fence.actions.iter().enumerate() {
        match handler_for(*action) {
            Some(handler) => handler(bus, event),
            None => tracing::warn!(
                fence_id = %event.fence_id,
                index,
                "unknown geofence action, skipping"
            ),
        }
    }
}

fn metadata(event: &GeoEvent, key: &str) -> Value {
    event.fence.metadata.get(key).cloned().unwrap_or(Value::Null)
}

fn send_notification(bus: &EventBus, event: &GeoEvent) {
    let name = &event.fence.name;
    let title = match event.kind {
        GeoEventKind::UserEntered => format!("You entered {name}"),
        GeoEventKind::UserExited => format!("You left {name}"),
        GeoEventKind::UserDwelled => format!("You are spending time at {name}"),
    };
    bus.publish_json(
        topics::NOTIFICATIONS,
        &json!({
            "type": "geofence",
            "user_id": event.user_id,
            "title": title,
            "message": metadata(event, "notification_message"),
            "data": {
                "fence_id": event.fence_id,
                "event": event.kind.as_str(),
            },
        }),
    );
    tracing::debug!(user_id = %event.user_id, fence_id = %event.fence_id, "geofence notification queued");
}

fn send_chat_invite(bus: &EventBus, event: &GeoEvent) {
    bus.publish_json(
        topics::CHAT_INVITES,
        &json!({
            "user_id": event.user_id,
            "fence_id": event.fence_id,
            "message": metadata(event, "chat_message"),
        }),
    );
}

fn send_ad(bus: &EventBus, event: &GeoEvent) {
    bus.publish_json(
        topics::ADS,
        &json!({
            "user_id": event.user_id,
            "fence_id": event.fence_id,
            "ad_data": metadata(event, "ad_data"),
        }),
    );
}

fn send_call_invite(bus: &EventBus, event: &GeoEvent) {
    bus.publish_json(
        topics::CALL_INVITES,
        &json!({
            "user_id": event.user_id,
            "fence_id": event.fence_id,
            "call_to": metadata(event, "call_to"),
        }),
    );
}
