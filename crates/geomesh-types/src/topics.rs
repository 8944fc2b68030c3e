//! Well-known event bus topic names.

/// Raw location updates, one message per `update_location` call.
pub const LOCATION_UPDATES: &str = "location_updates";
/// Geofence transitions.
pub const GEO_EVENTS: &str = "geo_events";
/// Targeted notifications (geofence actions and zone notifications).
pub const NOTIFICATIONS: &str = "notifications";
pub const CHAT_INVITES: &str = "chat_invites";
pub const ADS: &str = "ads";
pub const CALL_INVITES: &str = "call_invites";
/// Social record events (new posts, likes, comments).
pub const POST_EVENTS: &str = "post_events";
