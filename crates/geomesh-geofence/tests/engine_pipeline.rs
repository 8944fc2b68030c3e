//! End-to-end: location updates flow from the spatial store into the
//! geofence engine, and fences survive a restart through the record store.

use geomesh_bus::EventBus;
use geomesh_db::{
    open_migrated_pool, DbRuntimeSettings, Filter, Record, RecordStore, RecordWriter,
    SqliteRecordStore, StoreError,
};
use geomesh_geofence::GeofenceEngine;
use geomesh_spatial::SpatialStore;
use geomesh_types::{
    topics, ActionKind, GeoFence, Geometry, JsonMap, Location, Point, Presence, TriggerType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteRecordStore> {
    let path = dir.path().join("fences.db");
    let pool = open_migrated_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("pool should open");
    Arc::new(SqliteRecordStore::new(pool))
}

/// SQLite store whose saves take long enough for a later delete to overtake
/// them if writes were not ordered.
struct SlowSaves(SqliteRecordStore);

impl RecordStore for SlowSaves {
    fn save(&self, kind: &str, id: &str, fields: &JsonMap) -> Result<Record, StoreError> {
        std::thread::sleep(Duration::from_millis(50));
        self.0.save(kind, id, fields)
    }

    fn find_by_id(&self, kind: &str, id: &str) -> Result<Option<Record>, StoreError> {
        self.0.find_by_id(kind, id)
    }

    fn find_by_filter(
        &self,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.0.find_by_filter(kind, filter, limit)
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        self.0.delete(kind, id)
    }
}

fn office() -> GeoFence {
    GeoFence {
        id: "office".into(),
        name: "Office".into(),
        geometry: Geometry::Circle {
            center: Point::new(52.52, 13.405),
            radius_meters: 200.0,
        },
        trigger_type: TriggerType::Enter,
        actions: vec![ActionKind::Notification],
        metadata: JsonMap::new(),
        owner_id: "admin".into(),
        is_active: true,
    }
}

#[tokio::test]
async fn test_location_update_triggers_geofence_event() {
    let bus = EventBus::default();
    let mut geo_events = bus.subscribe(topics::GEO_EVENTS);
    let mut notifications = bus.subscribe(topics::NOTIFICATIONS);

    let engine = Arc::new(GeofenceEngine::new(bus.clone()));
    engine.add_fence(office());

    let spatial = SpatialStore::new(bus);
    spatial.add_listener(engine.clone());

    spatial.update_location("u1", Location::at(Point::new(52.52, 13.405)), Presence::Online);

    let event = tokio::time::timeout(Duration::from_secs(2), geo_events.recv())
        .await
        .expect("geo event within timeout")
        .expect("subscription open");
    assert_eq!(event.payload["type"], "user_entered");
    assert_eq!(event.payload["user_id"], "u1");

    let note = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
        .await
        .expect("notification within timeout")
        .expect("subscription open");
    assert_eq!(note.payload["title"], "You entered Office");
}

#[tokio::test]
async fn test_fences_restore_from_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let records = sqlite_store(&dir);
    let writer = RecordWriter::spawn(records.clone()).expect("writer thread");

    let engine = GeofenceEngine::new(EventBus::default()).with_persistence(writer.clone());
    engine.add_fence(office());
    writer.flush().await;
    assert!(records.find_by_id("geofence", "office").unwrap().is_some());

    // A row written with a geometry this build cannot read.
    let mut broken = JsonMap::new();
    broken.insert("name".into(), "Legacy".into());
    broken.insert("geometry".into(), "{\"type\":\"MultiPolygon\"}".into());
    records.save("geofence", "legacy", &broken).unwrap();

    let restarted = GeofenceEngine::new(EventBus::default()).with_persistence(writer);
    assert_eq!(restarted.restore().unwrap(), 2);

    let fence = restarted.get_fence("office").expect("office restored");
    assert_eq!(fence, office());
    let legacy = restarted.get_fence("legacy").expect("legacy restored");
    assert_eq!(legacy.geometry, Geometry::Unsupported);

    assert!(restarted
        .evaluate("u1", &Location::at(Point::new(52.52, 13.405)))
        .iter()
        .all(|e| e.fence_id == "office"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removed_fence_stays_removed_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = sqlite_store(&dir);
    let slow: Arc<dyn RecordStore> = Arc::new(SlowSaves(SqliteRecordStore::new(
        sqlite.pool().clone(),
    )));
    let writer = RecordWriter::spawn(slow).expect("writer thread");

    let engine = GeofenceEngine::new(EventBus::default()).with_persistence(writer.clone());
    engine.add_fence(office());
    engine.remove_fence("office").expect("fence was present");
    writer.flush().await;

    assert!(engine.get_fence("office").is_none());
    assert!(sqlite.find_by_id("geofence", "office").unwrap().is_none());

    let restarted = GeofenceEngine::new(EventBus::default()).with_persistence(writer);
    assert_eq!(restarted.restore().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_fence_update_is_the_one_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sqlite = sqlite_store(&dir);
    let slow: Arc<dyn RecordStore> = Arc::new(SlowSaves(SqliteRecordStore::new(
        sqlite.pool().clone(),
    )));
    let writer = RecordWriter::spawn(slow).expect("writer thread");

    let engine = GeofenceEngine::new(EventBus::default()).with_persistence(writer.clone());
    engine.add_fence(office());
    for name in ["Office East", "Office West"] {
        engine.update_fence(
            "office",
            geomesh_types::FenceUpdate {
                name: Some(name.into()),
                ..Default::default()
            },
        );
    }
    writer.flush().await;

    let restarted = GeofenceEngine::new(EventBus::default()).with_persistence(writer);
    restarted.restore().unwrap();
    assert_eq!(restarted.get_fence("office").unwrap().name, "Office West");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_user_enters_exactly_once_under_concurrent_updates() {
    const USERS: usize = 200;

    let bus = EventBus::new(4 * USERS);
    let mut geo_events = bus.subscribe(topics::GEO_EVENTS);

    let engine = Arc::new(GeofenceEngine::new(bus.clone()));
    let mut fence = office();
    fence.actions.clear();
    engine.add_fence(fence);

    let spatial = Arc::new(SpatialStore::new(bus));
    spatial.add_listener(engine.clone());

    let outside = Location::at(Point::new(53.0, 13.405));
    let inside = Location::at(Point::new(52.52, 13.405));
    let mut handles = Vec::new();
    for i in 0..USERS {
        let spatial = spatial.clone();
        let (outside, inside) = (outside.clone(), inside.clone());
        handles.push(tokio::spawn(async move {
            let user = format!("user_{i}");
            spatial.update_location(&user, outside, Presence::Online);
            spatial.update_location(&user, inside.clone(), Presence::Online);
            spatial.update_location(&user, inside, Presence::Online);
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    let mut entered: HashMap<String, usize> = HashMap::new();
    while entered.values().sum::<usize>() < USERS {
        let event = tokio::time::timeout(Duration::from_secs(5), geo_events.recv())
            .await
            .expect("every user should enter")
            .expect("subscription open");
        assert_eq!(event.payload["type"], "user_entered");
        let user = event.payload["user_id"].as_str().unwrap().to_string();
        *entered.entry(user).or_default() += 1;
    }

    // Let any late evaluations land before checking for duplicates.
    let extra = tokio::time::timeout(Duration::from_millis(300), geo_events.recv()).await;
    assert!(extra.is_err(), "unexpected extra event: {:?}", extra.ok().flatten().map(|m| m.payload));

    assert_eq!(entered.len(), USERS);
    assert!(entered.values().all(|count| *count == 1));
    for i in 0..USERS {
        let snapshot = engine.membership(&format!("user_{i}")).expect("evaluated");
        assert!(snapshot.contains("office"));
    }
}
