//! Concurrency tests for the EventBus.
//!
//! Publishers and subscribe/unsubscribe churn run in parallel; the registry
//! must neither deadlock nor leak subscriptions, and per-subscriber order
//! must hold.

use futures_util::StreamExt;
use geomesh_bus::EventBus;
use geomesh_types::JsonMap;
use serde_json::json;

fn seq(n: u64) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("seq".into(), json!(n));
    map
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_subscriber_order_preserved_under_concurrency() {
    let bus = EventBus::new(1_000);
    let mut subs: Vec<_> = (0..8).map(|_| bus.subscribe("location_updates")).collect();

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for n in 0..500 {
                bus.publish("location_updates", seq(n));
            }
        })
    };
    publisher.await.expect("publisher should not panic");

    for sub in &mut subs {
        let mut expected = 0;
        while let Some(msg) = sub.try_recv() {
            assert_eq!(msg.payload["seq"], expected);
            expected += 1;
        }
        assert_eq!(expected, 500, "each subscriber receives every message once");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribe_unsubscribe_no_leaks() {
    let bus = EventBus::default();
    let mut handles = Vec::new();

    for i in 0..100 {
        let bus = bus.clone();
        let topic = format!("topic_{}", i % 5);
        handles.push(tokio::spawn(async move {
            let mut sub = bus.subscribe(topic.clone());
            bus.publish(&topic, seq(i));
            sub.unsubscribe();
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }

    for i in 0..5 {
        assert_eq!(bus.subscriber_count(&format!("topic_{}", i)), 0);
    }
}

#[tokio::test]
async fn test_subscription_is_a_stream() {
    let bus = EventBus::default();
    let sub = bus.subscribe("ads");

    bus.publish("ads", seq(1));
    bus.publish("ads", seq(2));

    let got: Vec<_> = sub.take(2).map(|m| m.payload["seq"].clone()).collect().await;
    assert_eq!(got, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_dropped_bus_ends_subscription() {
    let bus = EventBus::default();
    let mut sub = bus.subscribe("t");
    bus.publish("t", seq(7));
    drop(bus);

    assert_eq!(sub.recv().await.unwrap().payload["seq"], 7);
    assert!(sub.recv().await.is_none());
}
