use crate::SpatialStore;
use geomesh_types::{topics, JsonMap, Point};
use serde::Deserialize;
use serde_json::{json, Value};

/// Area targeted by a zone notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Zone {
    Radius { center: Point, radius_meters: f64 },
    Polygon { vertices: Vec<Point> },
}

/// Broadcast request to every non-stale user inside a zone.
///
/// Wire shape: `{point, radius}` or `{polygon}`, plus `title`, `message`
/// and optional `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneNotification {
    #[serde(default)]
    pub point: Option<Point>,
    #[serde(default)]
    pub radius: f64,
    #[serde(default)]
    pub polygon: Option<Vec<Point>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: JsonMap,
}

impl ZoneNotification {
    /// The targeted zone. A point wins over a polygon when both are given.
    pub fn zone(&self) -> Option<Zone> {
        if let Some(center) = self.point {
            return Some(Zone::Radius {
                center,
                radius_meters: self.radius,
            });
        }
        self.polygon.clone().map(|vertices| Zone::Polygon { vertices })
    }
}

impl SpatialStore {
    /// Publishes a `zone_notification` on the notifications topic for each
    /// non-stale user in `zone`. Returns how many users were targeted.
    pub fn notify_zone(&self, zone: &Zone, title: &str, message: &str, data: &JsonMap) -> usize {
        let users = match zone {
            Zone::Radius {
                center,
                radius_meters,
            } => self.find_nearby(*center, *radius_meters, None),
            Zone::Polygon { vertices } => self.find_in_polygon(vertices),
        };

        for user in &users {
            let payload = json!({
                "type": "zone_notification",
                "user_id": user.user_id,
                "title": title,
                "message": message,
                "data": Value::Object(data.clone()),
            });
            self.bus().publish_json(topics::NOTIFICATIONS, &payload);
        }

        tracing::info!(count = users.len(), "zone notification sent");
        users.len()
    }
}
