//! Integration tests for the notification listener
//!
//! These tests require the test PostgreSQL database to be running and
//! exercise the LISTEN/NOTIFY path end to end.

use crate::common::{mapper_or_skip, test_connection_config};
use mapgres::db::{ChangeEvent, Mapper};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn wait_for_events(
    events: &Arc<Mutex<Vec<ChangeEvent>>>,
    expected: usize,
) -> Vec<ChangeEvent> {
    for _ in 0..50 {
        if events.lock().unwrap().len() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    events.lock().unwrap().clone()
}

#[tokio::test]
async fn test_notify_reaches_handler() {
    // Probe for a reachable server before spawning the listen loop
    let Some(mut notifier) = mapper_or_skip("unused").await else {
        return;
    };

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let mut mapper = Mapper::new(test_connection_config(), "unused");
    mapper.set_handler(move |event| sink.lock().unwrap().push(event));
    let listen = tokio::spawn(async move { mapper.listen().await });

    // Give the LISTEN subscription time to register
    tokio::time::sleep(Duration::from_secs(1)).await;

    notifier
        .execute(r#"SELECT pg_notify('finery', '{"a":1}')"#)
        .await
        .expect("notify");

    let received = wait_for_events(&events, 1).await;
    listen.abort();

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].channel, "finery");
    assert_eq!(received[0].payload, serde_json::json!({"a": 1}));
}

#[tokio::test]
async fn test_malformed_payload_skipped_loop_survives() {
    let Some(mut notifier) = mapper_or_skip("unused").await else {
        return;
    };

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let mut mapper = Mapper::new(test_connection_config(), "unused");
    mapper.set_handler(move |event| sink.lock().unwrap().push(event));
    let listen = tokio::spawn(async move { mapper.listen().await });

    tokio::time::sleep(Duration::from_secs(1)).await;

    // Malformed payload first; the loop must log it, skip the handler, and
    // keep dispatching subsequent events
    notifier
        .execute("SELECT pg_notify('finery', 'not json')")
        .await
        .expect("notify");
    notifier
        .execute(r#"SELECT pg_notify('finery', '{"ok":true}')"#)
        .await
        .expect("notify");

    let received = wait_for_events(&events, 1).await;
    listen.abort();

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn test_listen_fails_fast_when_unreachable() {
    let mut config = test_connection_config();
    config.host = "invalid-host-that-does-not-exist.local".to_string();
    config.port = 59999;

    let mut mapper = Mapper::new(config, "unused");
    let result = mapper.listen().await;
    assert!(result.is_err(), "listen should surface the connect failure");
}
