//! Concurrency tests for the session registry.
//!
//! Many tasks race to open the same device; exactly one `openDevice` must
//! reach the engine and every task must get the same shared device.

mod common;

use std::sync::Arc;
use std::time::Duration;

use droidrpc_core::binding::entry;
use droidrpc_core::mock_engine::MockEngine;
use droidrpc_core::session::DeviceKey;
use droidrpc_core::RpcError;

use common::registry;

/// An engine whose `openDevice` blocks briefly, widening the race window.
fn slow_open_engine() -> MockEngine {
    MockEngine::device().with_fn(entry::OPEN_DEVICE, |_, _| {
        std::thread::sleep(Duration::from_millis(20));
        MockEngine::DEVICE_HANDLE
    })
}

// ---------------------------------------------------------------------------
// Single open under contention
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_opens_once() {
    let (engine, registry) = registry(slow_open_engine());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("10.0.0.5", 7101).await })
        })
        .collect();

    let mut devices = Vec::new();
    for task in tasks {
        devices.push(task.await.unwrap().unwrap());
    }

    assert_eq!(engine.call_count(entry::OPEN_DEVICE), 1);
    assert!(devices.iter().all(|d| Arc::ptr_eq(d, &devices[0])));
    assert_eq!(registry.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_devices_open_independently() {
    let (engine, registry) = registry(slow_open_engine());

    let tasks: Vec<_> = (7101..7105)
        .flat_map(|port| (0..4).map(move |_| port))
        .map(|port| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("10.0.0.5", port).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(engine.call_count(entry::OPEN_DEVICE), 4);
    assert_eq!(registry.keys().await.len(), 4);
    let hosts = engine.strings_for(entry::OPEN_DEVICE);
    assert!(hosts.iter().all(|host| host == "10.0.0.5"));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_failure_leaves_slot_retryable() {
    let (engine, registry) = registry(MockEngine::device().with(entry::CHECK_LIVE, 0));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("10.0.0.5", 7101).await })
        })
        .collect();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::NotAlive(_)));
    }

    // Every failed attempt closed the handle it opened.
    assert_eq!(
        engine.call_count(entry::OPEN_DEVICE),
        engine.call_count(entry::CLOSE_DEVICE)
    );
    assert!(registry
        .get(&DeviceKey::new("10.0.0.5", 7101))
        .await
        .is_none());
}

#[tokio::test]
async fn test_close_all_then_reconnect() {
    let (engine, registry) = registry(MockEngine::device());
    registry.get_or_create("10.0.0.5", 7101).await.unwrap();
    registry.close_all().await;
    assert!(registry.is_empty().await);

    registry.get_or_create("10.0.0.5", 7101).await.unwrap();
    assert_eq!(engine.call_count(entry::OPEN_DEVICE), 2);
    assert_eq!(engine.call_count(entry::CLOSE_DEVICE), 1);
}
