use crate::actions;
use crate::persistence::{fence_fields, fence_from_record, FENCE_KIND};
use chrono::{DateTime, Utc};
use geomesh_bus::EventBus;
use geomesh_db::{Filter, RecordWriter, StoreError};
use geomesh_spatial::{geo, LocationListener};
use geomesh_types::sync::{lock_or_recover, read_or_recover, write_or_recover};
use geomesh_types::{
    topics, FenceUpdate, GeoEvent, GeoEventKind, GeoFence, Location, TriggerType,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Dwell threshold used when a fence has no `dwell_seconds` metadata.
pub const DEFAULT_DWELL_SECONDS: u64 = 300;

/// Upper bound on fences loaded by [`GeofenceEngine::restore`].
const RESTORE_LIMIT: usize = 100_000;

/// Fences a user was inside as of their last evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipSnapshot {
    /// fence id -> time the current stay began.
    inside: HashMap<String, DateTime<Utc>>,
    /// Fences whose dwell event already fired for the current stay.
    dwell_fired: HashSet<String>,
}

impl MembershipSnapshot {
    pub fn contains(&self, fence_id: &str) -> bool {
        self.inside.contains_key(fence_id)
    }

    pub fn entered_at(&self, fence_id: &str) -> Option<DateTime<Utc>> {
        self.inside.get(fence_id).copied()
    }

    pub fn fence_ids(&self) -> impl Iterator<Item = &str> {
        self.inside.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inside.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inside.is_empty()
    }
}

/// Per-user evaluation state. Its mutex is held from reading the previous
/// snapshot until the next one is stored and its events are emitted.
#[derive(Default)]
struct UserTrack {
    snapshot: Arc<MembershipSnapshot>,
    /// Highest spatial-store sequence applied so far.
    last_sequence: u64,
}

/// Owns the fence set and the per-user membership snapshots.
///
/// Fences and the membership map sit behind separate locks, independent of
/// the spatial store's. Evaluations for one user are serialized by that
/// user's track; different users evaluate in parallel.
pub struct GeofenceEngine {
    fences: RwLock<HashMap<String, GeoFence>>,
    memberships: RwLock<HashMap<String, Arc<Mutex<UserTrack>>>>,
    bus: EventBus,
    writer: Option<RecordWriter>,
}

impl GeofenceEngine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            fences: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            bus,
            writer: None,
        }
    }

    /// Writes fence changes through `writer` and restores from its store.
    pub fn with_persistence(mut self, writer: RecordWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Loads persisted fences, replacing any in memory with the same id.
    ///
    /// Blocking. Returns the number of fences loaded.
    pub fn restore(&self) -> Result<usize, StoreError> {
        let Some(writer) = &self.writer else {
            return Ok(0);
        };
        let records = writer
            .store()
            .find_by_filter(FENCE_KIND, &Filter::new(), RESTORE_LIMIT)?;
        let mut fences = write_or_recover(&self.fences, "geofences");
        for record in &records {
            let fence = fence_from_record(record);
            fences.insert(fence.id.clone(), fence);
        }
        tracing::info!(count = records.len(), "restored geofences");
        Ok(records.len())
    }

    /// Inserts or replaces a fence.
    ///
    /// Writes are queued while the fence lock is held, so the store sees
    /// fence changes in the order they were applied here.
    pub fn add_fence(&self, fence: GeoFence) -> GeoFence {
        {
            let mut fences = write_or_recover(&self.fences, "geofences");
            fences.insert(fence.id.clone(), fence.clone());
            self.persist(&fence);
        }
        tracing::info!(fence_id = %fence.id, geometry = fence.geometry.kind(), "geofence added");
        fence
    }

    /// Removes a fence. Returns `None` if it did not exist.
    pub fn remove_fence(&self, fence_id: &str) -> Option<GeoFence> {
        let removed = {
            let mut fences = write_or_recover(&self.fences, "geofences");
            let removed = fences.remove(fence_id)?;
            if let Some(writer) = &self.writer {
                writer.delete(FENCE_KIND, fence_id);
            }
            removed
        };
        tracing::info!(fence_id = %fence_id, "geofence removed");
        Some(removed)
    }

    /// Applies a partial update. Returns the updated fence, or `None` if it
    /// does not exist.
    pub fn update_fence(&self, fence_id: &str, update: FenceUpdate) -> Option<GeoFence> {
        let updated = {
            let mut fences = write_or_recover(&self.fences, "geofences");
            let fence = fences.get_mut(fence_id)?;
            update.apply_to(fence);
            self.persist(fence);
            fence.clone()
        };
        tracing::info!(fence_id = %fence_id, "geofence updated");
        Some(updated)
    }

    pub fn get_fence(&self, fence_id: &str) -> Option<GeoFence> {
        read_or_recover(&self.fences, "geofences")
            .get(fence_id)
            .cloned()
    }

    /// All fences ordered by id.
    pub fn list_fences(&self) -> Vec<GeoFence> {
        let mut fences: Vec<_> = read_or_recover(&self.fences, "geofences")
            .values()
            .cloned()
            .collect();
        fences.sort_by(|a, b| a.id.cmp(&b.id));
        fences
    }

    pub fn membership(&self, user_id: &str) -> Option<Arc<MembershipSnapshot>> {
        let track = read_or_recover(&self.memberships, "geofence_memberships")
            .get(user_id)
            .cloned()?;
        let snapshot = Arc::clone(&lock_or_recover(&track, "geofence_track").snapshot);
        Some(snapshot)
    }

    /// Evaluates `location` against every active fence, publishes the
    /// resulting events and runs their actions.
    pub fn evaluate(&self, user_id: &str, location: &Location) -> Vec<GeoEvent> {
        self.evaluate_at(user_id, location, Utc::now())
    }

    /// [`evaluate`](Self::evaluate) with an explicit clock reading.
    pub fn evaluate_at(
        &self,
        user_id: &str,
        location: &Location,
        now: DateTime<Utc>,
    ) -> Vec<GeoEvent> {
        self.evaluate_sample(user_id, location, now, None)
    }

    /// Evaluates one spatial-store sample. A sample whose `sequence` is not
    /// newer than the last one applied for the user is dropped.
    pub fn evaluate_sequenced(
        &self,
        user_id: &str,
        location: &Location,
        sequence: u64,
    ) -> Vec<GeoEvent> {
        self.evaluate_sample(user_id, location, Utc::now(), Some(sequence))
    }

    fn track(&self, user_id: &str) -> Arc<Mutex<UserTrack>> {
        if let Some(track) = read_or_recover(&self.memberships, "geofence_memberships").get(user_id) {
            return Arc::clone(track);
        }
        Arc::clone(
            write_or_recover(&self.memberships, "geofence_memberships")
                .entry(user_id.to_string())
                .or_default(),
        )
    }

    fn evaluate_sample(
        &self,
        user_id: &str,
        location: &Location,
        now: DateTime<Utc>,
        sequence: Option<u64>,
    ) -> Vec<GeoEvent> {
        let track = self.track(user_id);
        let mut track = lock_or_recover(&track, "geofence_track");
        if let Some(sequence) = sequence {
            if sequence <= track.last_sequence {
                tracing::debug!(
                    user_id = %user_id,
                    sequence,
                    last = track.last_sequence,
                    "stale location sample, skipping"
                );
                return Vec::new();
            }
            track.last_sequence = sequence;
        }

        let active: Vec<GeoFence> = read_or_recover(&self.fences, "geofences")
            .values()
            .filter(|f| f.is_active)
            .cloned()
            .collect();
        let previous = Arc::clone(&track.snapshot);

        let mut next = MembershipSnapshot::default();
        let mut events = Vec::new();

        for fence in active {
            let inside = geo::contains(&fence.geometry, location.point);
            let kind = match (previous.entered_at(&fence.id), inside) {
                (None, true) => {
                    next.inside.insert(fence.id.clone(), now);
                    if fence.trigger_type == TriggerType::Enter {
                        Some(GeoEventKind::UserEntered)
                    } else {
                        check_dwell(&fence, now, now, &previous, &mut next)
                    }
                }
                (Some(since), true) => {
                    next.inside.insert(fence.id.clone(), since);
                    check_dwell(&fence, since, now, &previous, &mut next)
                }
                (Some(_), false) => {
                    matches!(fence.trigger_type, TriggerType::Exit).then_some(GeoEventKind::UserExited)
                }
                (None, false) => None,
            };

            if let Some(kind) = kind {
                events.push(GeoEvent {
                    kind,
                    user_id: user_id.to_string(),
                    fence_id: fence.id.clone(),
                    fence,
                    location: location.clone(),
                    timestamp: now,
                });
            }
        }

        track.snapshot = Arc::new(next);

        for event in &events {
            self.emit(event);
        }
        events
    }

    fn emit(&self, event: &GeoEvent) {
        tracing::info!(
            user_id = %event.user_id,
            fence_id = %event.fence_id,
            event = event.kind.as_str(),
            "geofence event"
        );
        self.bus.publish_json(topics::GEO_EVENTS, event);
        actions::execute_all(&self.bus, event);
    }

    fn persist(&self, fence: &GeoFence) {
        if let Some(writer) = &self.writer {
            writer.save(FENCE_KIND, fence.id.clone(), fence_fields(fence));
        }
    }
}

impl LocationListener for GeofenceEngine {
    fn on_location_updated(&self, user_id: &str, location: &Location, sequence: u64) {
        self.evaluate_sequenced(user_id, location, sequence);
    }
}

/// Marks and reports a dwell once the stay reaches the fence's threshold.
fn check_dwell(
    fence: &GeoFence,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    previous: &MembershipSnapshot,
    next: &mut MembershipSnapshot,
) -> Option<GeoEventKind> {
    if fence.trigger_type != TriggerType::Dwell {
        return None;
    }
    if previous.dwell_fired.contains(&fence.id) {
        next.dwell_fired.insert(fence.id.clone());
        return None;
    }
    let stayed = (now - since).num_seconds().max(0) as u64;
    if stayed < dwell_threshold(fence) {
        return None;
    }
    next.dwell_fired.insert(fence.id.clone());
    Some(GeoEventKind::UserDwelled)
}

fn dwell_threshold(fence: &GeoFence) -> u64 {
    match fence.metadata.get("dwell_seconds") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|s| *s >= 0.0).map(|s| s as u64))
            .unwrap_or(DEFAULT_DWELL_SECONDS),
        _ => DEFAULT_DWELL_SECONDS,
    }
}
