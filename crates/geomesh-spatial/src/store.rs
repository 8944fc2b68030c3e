//! In-memory registry of the latest location per user.

use crate::geo::{haversine_distance, is_point_in_polygon};
use chrono::{DateTime, Utc};
use geomesh_bus::EventBus;
use geomesh_db::RecordWriter;
use geomesh_types::sync::{read_or_recover, write_or_recover};
use geomesh_types::{topics, JsonMap, Location, LocationUpdatePayload, Point, Presence, UserPresence};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Samples older than this are ignored by spatial queries.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(300);

/// Record kind used for persisted presence rows.
const PRESENCE_KIND: &str = "presence";

/// Callback run after every accepted location update.
///
/// Listeners are invoked on a spawned task, never under the registry lock,
/// so calls for one user may arrive out of order. `sequence` is assigned
/// under the lock and increases with every update; a listener that keeps
/// per-user state discards calls older than the last one it applied.
pub trait LocationListener: Send + Sync {
    fn on_location_updated(&self, user_id: &str, location: &Location, sequence: u64);
}

/// Latest presence per user, guarded by a single reader/writer lock.
pub struct SpatialStore {
    records: RwLock<HashMap<String, UserPresence>>,
    bus: EventBus,
    writer: Option<RecordWriter>,
    listeners: RwLock<Vec<Arc<dyn LocationListener>>>,
    staleness: Duration,
    sequence: AtomicU64,
}

impl SpatialStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bus,
            writer: None,
            listeners: RwLock::new(Vec::new()),
            staleness: DEFAULT_STALENESS,
            sequence: AtomicU64::new(0),
        }
    }

    /// Persists every accepted update through `writer`.
    pub fn with_persistence(mut self, writer: RecordWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Registers a listener for subsequent updates.
    pub fn add_listener(&self, listener: Arc<dyn LocationListener>) {
        write_or_recover(&self.listeners, "spatial_listeners").push(listener);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Replaces the stored record for `user_id`.
    ///
    /// The persistence write is queued under the registry lock so rows land
    /// in registry order. Broadcast and listeners run after the lock is
    /// released; listeners are detached tasks when a runtime is present.
    pub fn update_location(
        &self,
        user_id: &str,
        location: Location,
        presence: Presence,
    ) -> UserPresence {
        let record = UserPresence {
            user_id: user_id.to_string(),
            location,
            presence,
            updated_at: Utc::now(),
        };

        let sequence = {
            let mut records = write_or_recover(&self.records, "spatial_store");
            records.insert(user_id.to_string(), record.clone());
            if let Some(writer) = &self.writer {
                writer.save(PRESENCE_KIND, user_id, presence_fields(&record));
            }
            self.sequence.fetch_add(1, Ordering::Relaxed) + 1
        };

        tracing::debug!(
            user_id = %user_id,
            lat = record.location.point.lat,
            lng = record.location.point.lng,
            presence = %presence,
            "location updated"
        );

        self.bus.publish_json(
            topics::LOCATION_UPDATES,
            &LocationUpdatePayload {
                user_id: record.user_id.clone(),
                location: record.location.clone(),
                presence,
            },
        );

        let listeners = read_or_recover(&self.listeners, "spatial_listeners").clone();
        for listener in listeners {
            let user = record.user_id.clone();
            let location = record.location.clone();
            run_detached(move || listener.on_location_updated(&user, &location, sequence));
        }

        record
    }

    /// Returns the current record, stale or not.
    pub fn get_location(&self, user_id: &str) -> Option<UserPresence> {
        read_or_recover(&self.records, "spatial_store")
            .get(user_id)
            .cloned()
    }

    /// Non-stale users within `radius_meters` of `center`.
    pub fn find_nearby(
        &self,
        center: Point,
        radius_meters: f64,
        exclude_user_id: Option<&str>,
    ) -> Vec<UserPresence> {
        let exclude = exclude_user_id.filter(|id| !id.is_empty());
        let now = Utc::now();
        read_or_recover(&self.records, "spatial_store")
            .values()
            .filter(|r| Some(r.user_id.as_str()) != exclude)
            .filter(|r| self.is_fresh(r.updated_at, now))
            .filter(|r| haversine_distance(center, r.location.point) <= radius_meters)
            .cloned()
            .collect()
    }

    /// Non-stale users inside the polygon.
    pub fn find_in_polygon(&self, vertices: &[Point]) -> Vec<UserPresence> {
        let now = Utc::now();
        read_or_recover(&self.records, "spatial_store")
            .values()
            .filter(|r| self.is_fresh(r.updated_at, now))
            .filter(|r| is_point_in_polygon(r.location.point, vertices))
            .cloned()
            .collect()
    }

    /// All users currently in `presence`, regardless of age.
    pub fn get_by_presence(&self, presence: Presence) -> Vec<UserPresence> {
        read_or_recover(&self.records, "spatial_store")
            .values()
            .filter(|r| r.presence == presence)
            .cloned()
            .collect()
    }

    /// Re-reports the user's last location with a new presence state.
    ///
    /// Returns `None` without side effects if the user has no location yet.
    pub fn set_presence(&self, user_id: &str, presence: Presence) -> Option<UserPresence> {
        let previous = self.get_location(user_id)?;
        Some(self.update_location(user_id, previous.location, presence))
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.records, "spatial_store").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - updated_at).to_std() {
            Ok(age) => age <= self.staleness,
            // Timestamps slightly ahead of `now` are fresh.
            Err(_) => true,
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, record: UserPresence) {
        write_or_recover(&self.records, "spatial_store").insert(record.user_id.clone(), record);
    }
}

fn presence_fields(record: &UserPresence) -> JsonMap {
    let mut fields = JsonMap::new();
    fields.insert(
        "location".into(),
        serde_json::to_value(&record.location).unwrap_or(Value::Null),
    );
    fields.insert("presence".into(), json!(record.presence));
    fields.insert("last_seen".into(), json!(record.updated_at));
    fields
}

/// Runs `f` on a spawned task if a runtime is available, inline otherwise.
fn run_detached<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}
