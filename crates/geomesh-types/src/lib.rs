//! Shared types for the geomesh real-time location platform.
//!
//! This crate provides the data model used across all geomesh crates:
//! user presence records, geofence definitions with their tagged geometry,
//! geofence events, and the wire envelopes exchanged over the event bus,
//! the push stream and the bidirectional session.
//!
//! No crate in the workspace depends on anything *except* `geomesh-types` for
//! cross-cutting type definitions, which keeps the dependency graph acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod envelope;
pub mod sync;
pub mod topics;

pub use envelope::{
    Envelope, LocationUpdatePayload, ParseRpcMethodError, PubSubMessage, RpcMethod, RpcRequest,
    RpcResponse,
};

/// JSON object used for free-form payloads, metadata and RPC bodies.
pub type JsonMap = Map<String, Value>;

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Returns `true` when both coordinates are finite and within range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A single location sample reported by a client.
///
/// On the wire the coordinate is flattened: `{lat, lng, accuracy, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(flatten)]
    pub point: Point,
    /// Horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy: f64,
    /// Altitude in meters.
    #[serde(default)]
    pub altitude: f64,
    /// Ground speed in m/s.
    #[serde(default)]
    pub speed: f64,
    /// Heading in degrees.
    #[serde(default)]
    pub heading: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Location {
    /// Builds a location sample at `point` stamped with the current time.
    pub fn at(point: Point) -> Self {
        Self {
            point,
            accuracy: 0.0,
            altitude: 0.0,
            speed: 0.0,
            heading: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// A user's availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Presence {
    type Err = ParsePresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            _ => Err(ParsePresenceError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown presence string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown presence state: {0}")]
pub struct ParsePresenceError(pub String);

/// The latest known location and presence of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub location: Location,
    pub presence: Presence,
    pub updated_at: DateTime<Utc>,
}

/// Geofence region shape.
///
/// Unknown `type` tags deserialize to [`Geometry::Unsupported`], which never
/// contains any point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Circle {
        center: Point,
        radius_meters: f64,
    },
    Polygon {
        vertices: Vec<Point>,
    },
    #[serde(other)]
    Unsupported,
}

impl Geometry {
    /// Returns `true` when the geometry can be evaluated at all.
    ///
    /// A circle needs a valid center and a finite, non-negative radius; a
    /// polygon needs at least three valid vertices.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Circle {
                center,
                radius_meters,
            } => center.is_valid() && radius_meters.is_finite() && *radius_meters >= 0.0,
            Self::Polygon { vertices } => {
                vertices.len() >= 3 && vertices.iter().all(Point::is_valid)
            }
            Self::Unsupported => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Circle { .. } => "Circle",
            Self::Polygon { .. } => "Polygon",
            Self::Unsupported => "Unsupported",
        }
    }
}

/// Condition under which a geofence fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Enter,
    Exit,
    Dwell,
}

/// Side effect executed when a geofence fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ActionKind {
    Notification,
    Chat,
    Ads,
    Call,
    /// Any action name this build does not know. Logged and skipped.
    Unknown,
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "notification" => Self::Notification,
            "chat" => Self::Chat,
            "ads" => Self::Ads,
            "call" => Self::Call,
            _ => Self::Unknown,
        }
    }
}

/// A named geographic region with a trigger and ordered actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFence {
    pub id: String,
    pub name: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub actions: Vec<ActionKind>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl GeoFence {
    /// Returns the metadata value under `key` as a string, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Partial update applied to an existing geofence.
///
/// Only fields that are `Some` are modified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FenceUpdate {
    pub name: Option<String>,
    pub geometry: Option<Geometry>,
    pub trigger_type: Option<TriggerType>,
    pub actions: Option<Vec<ActionKind>>,
    pub metadata: Option<JsonMap>,
    pub is_active: Option<bool>,
}

impl FenceUpdate {
    /// Applies the populated fields to `fence`.
    pub fn apply_to(self, fence: &mut GeoFence) {
        if let Some(name) = self.name {
            fence.name = name;
        }
        if let Some(geometry) = self.geometry {
            fence.geometry = geometry;
        }
        if let Some(trigger_type) = self.trigger_type {
            fence.trigger_type = trigger_type;
        }
        if let Some(actions) = self.actions {
            fence.actions = actions;
        }
        if let Some(metadata) = self.metadata {
            fence.metadata = metadata;
        }
        if let Some(is_active) = self.is_active {
            fence.is_active = is_active;
        }
    }
}

/// Kind of geofence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoEventKind {
    UserEntered,
    UserExited,
    UserDwelled,
}

impl GeoEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserEntered => "user_entered",
            Self::UserExited => "user_exited",
            Self::UserDwelled => "user_dwelled",
        }
    }
}

/// A geofence transition for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoEvent {
    #[serde(rename = "type")]
    pub kind: GeoEventKind,
    pub user_id: String,
    pub fence_id: String,
    pub fence: GeoFence,
    pub location: Location,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn location_wire_shape_is_flat() {
        let loc = Location::at(Point::new(48.8566, 2.3522));
        let value = serde_json::to_value(&loc).unwrap();
        assert_eq!(value["lat"], 48.8566);
        assert_eq!(value["lng"], 2.3522);
        assert!(value.get("point").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn location_defaults_missing_fields() {
        let loc: Location = serde_json::from_value(json!({"lat": 1.0, "lng": 2.0})).unwrap();
        assert_eq!(loc.point, Point::new(1.0, 2.0));
        assert_eq!(loc.accuracy, 0.0);
        assert_eq!(loc.heading, 0.0);
    }

    #[test]
    fn presence_parses_and_displays() {
        for p in [
            Presence::Online,
            Presence::Away,
            Presence::Busy,
            Presence::Offline,
        ] {
            assert_eq!(p.as_str().parse::<Presence>().unwrap(), p);
        }
        assert!("invisible".parse::<Presence>().is_err());
    }

    #[test]
    fn unknown_geometry_kind_is_unsupported() {
        let g: Geometry =
            serde_json::from_value(json!({"type": "Hexagon", "side": 3.0})).unwrap();
        assert_eq!(g, Geometry::Unsupported);
        assert!(!g.is_well_formed());
    }

    #[test]
    fn degenerate_geometry_is_not_well_formed() {
        let two_points = Geometry::Polygon {
            vertices: vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
        };
        assert!(!two_points.is_well_formed());

        let negative = Geometry::Circle {
            center: Point::new(0.0, 0.0),
            radius_meters: -5.0,
        };
        assert!(!negative.is_well_formed());
    }

    #[test]
    fn fence_defaults_trigger_and_activity() {
        let fence: GeoFence = serde_json::from_value(json!({
            "id": "f1",
            "name": "Office",
            "geometry": {"type": "Circle", "center": {"lat": 0.0, "lng": 0.0}, "radius_meters": 50.0},
            "actions": ["notification", "teleport", "call"]
        }))
        .unwrap();
        assert_eq!(fence.trigger_type, TriggerType::Enter);
        assert!(fence.is_active);
        assert_eq!(
            fence.actions,
            vec![ActionKind::Notification, ActionKind::Unknown, ActionKind::Call]
        );
    }

    #[test]
    fn fence_update_only_touches_populated_fields() {
        let mut fence = GeoFence {
            id: "f1".into(),
            name: "Park".into(),
            geometry: Geometry::Unsupported,
            trigger_type: TriggerType::Enter,
            actions: vec![ActionKind::Ads],
            metadata: JsonMap::new(),
            owner_id: "owner".into(),
            is_active: true,
        };
        FenceUpdate {
            is_active: Some(false),
            ..Default::default()
        }
        .apply_to(&mut fence);
        assert!(!fence.is_active);
        assert_eq!(fence.name, "Park");
        assert_eq!(fence.actions, vec![ActionKind::Ads]);
    }

    #[test]
    fn geo_event_serializes_type_tag() {
        let fence = GeoFence {
            id: "f1".into(),
            name: "Park".into(),
            geometry: Geometry::Unsupported,
            trigger_type: TriggerType::Exit,
            actions: vec![],
            metadata: JsonMap::new(),
            owner_id: String::new(),
            is_active: true,
        };
        let event = GeoEvent {
            kind: GeoEventKind::UserExited,
            user_id: "u1".into(),
            fence_id: "f1".into(),
            fence,
            location: Location::at(Point::new(0.0, 0.0)),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user_exited");
        assert_eq!(value["fence"]["trigger_type"], "exit");
    }
}
