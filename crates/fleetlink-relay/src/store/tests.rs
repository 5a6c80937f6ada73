//! Store tests against an in-memory SQLite database.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use fleetlink_core::clock::MockClock;

use super::*;

const TENANT: &str = "123456789012345678901234";
const DEVICE: &str = "818c6ec3-051e-42ce-be79-7f75bc2b2da9";

async fn store_at(clock: &Arc<MockClock>) -> RelayStore {
    RelayStore::open_in_memory(clock.clone(), Duration::from_secs(3600))
        .await
        .unwrap()
}

fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        user_id: "9f56b9c3-d510-4107-9686-8a1c4969e02d".to_string(),
        device_id: DEVICE.to_string(),
        tenant_id: TENANT.to_string(),
        start_ts: 1_515_797_508_324,
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[tokio::test]
async fn provision_and_get_device() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    store.provision_tenant(TENANT).await.unwrap();
    store.provision_device(TENANT, DEVICE).await.unwrap();

    let device = store.get_device(TENANT, DEVICE).await.unwrap().unwrap();
    assert_eq!(device.device_id, DEVICE);
    assert_eq!(device.status, DeviceStatus::Unknown);
    assert_eq!(device.created_ts, 1_000);
    assert_eq!(device.updated_ts, 1_000);
}

#[tokio::test]
async fn provision_device_is_idempotent() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    store.provision_device(TENANT, DEVICE).await.unwrap();
    clock.set(2_000);
    store.provision_device(TENANT, DEVICE).await.unwrap();

    let device = store.get_device(TENANT, DEVICE).await.unwrap().unwrap();
    assert_eq!(device.created_ts, 1_000);
    assert_eq!(device.updated_ts, 1_000);
}

#[tokio::test]
async fn get_missing_device_is_none() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let device = store.get_device(TENANT, "no-such-device").await.unwrap();
    assert!(device.is_none());
}

#[tokio::test]
async fn upsert_status_preserves_created_ts() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    store.provision_device(TENANT, DEVICE).await.unwrap();

    clock.set(5_000);
    store
        .upsert_device_status(TENANT, DEVICE, DeviceStatus::Connected)
        .await
        .unwrap();

    let device = store.get_device(TENANT, DEVICE).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Connected);
    assert_eq!(device.created_ts, 1_000);
    assert_eq!(device.updated_ts, 5_000);

    clock.set(6_000);
    store
        .upsert_device_status(TENANT, DEVICE, DeviceStatus::Disconnected)
        .await
        .unwrap();

    let device = store.get_device(TENANT, DEVICE).await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Disconnected);
    assert_eq!(device.created_ts, 1_000);
    assert_eq!(device.updated_ts, 6_000);
}

#[tokio::test]
async fn upsert_status_inserts_unseen_device() {
    let clock = MockClock::shared(3_000);
    let store = store_at(&clock).await;

    store
        .upsert_device_status(TENANT, "efgh", DeviceStatus::Connected)
        .await
        .unwrap();

    let device = store.get_device(TENANT, "efgh").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Connected);
    assert_eq!(device.created_ts, 3_000);
    assert_eq!(device.updated_ts, 3_000);
}

#[tokio::test]
async fn delete_device_removes_row() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    store.provision_device(TENANT, DEVICE).await.unwrap();
    store.delete_device(TENANT, DEVICE).await.unwrap();

    assert!(store.get_device(TENANT, DEVICE).await.unwrap().is_none());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    store.provision_device("tenant-a", DEVICE).await.unwrap();

    assert!(store.get_device("tenant-b", DEVICE).await.unwrap().is_none());
    assert!(store.get_device("", DEVICE).await.unwrap().is_none());
    assert!(store.get_device("tenant-a", DEVICE).await.unwrap().is_some());
}

#[tokio::test]
async fn allocate_session_rejects_incomplete_records() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let mut blank_start = session("0ff7cda3-a398-43b0-9776-6622cb6aa111");
    blank_start.start_ts = 0;
    let err = store.allocate_session(&blank_start).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidSession(ref msg) if msg.contains("start_ts")));

    let mut blank_user = session("0ff7cda3-a398-43b0-9776-6622cb6aa112");
    blank_user.user_id = String::new();
    let err = store.allocate_session(&blank_user).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidSession(ref msg) if msg.contains("user_id")));

    let mut blank_device = session("0ff7cda3-a398-43b0-9776-6622cb6aa113");
    blank_device.device_id = String::new();
    let err = store.allocate_session(&blank_device).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidSession(ref msg) if msg.contains("device_id")));

    let mut blank_id = session("");
    blank_id.id = String::new();
    let err = store.allocate_session(&blank_id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidSession(ref msg) if msg.contains("id")));
}

#[tokio::test]
async fn allocate_session_duplicate_id_is_conflict() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let sess = session("0ff7cda3-a398-43b0-9776-6622cb6aa110");
    store.allocate_session(&sess).await.unwrap();

    let err = store.allocate_session(&sess).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn delete_session_returns_stored_record() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let sess = session("00000000-0000-0000-0000-000000000000");
    store.allocate_session(&sess).await.unwrap();

    let deleted = store.delete_session(&sess.id).await.unwrap();
    assert_eq!(deleted, sess);

    let err = store.delete_session(&sess.id).await.unwrap_err();
    assert!(matches!(err, StoreError::SessionNotFound));
}

#[tokio::test]
async fn get_session_after_allocate() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let sess = session("00000000-0000-0000-0000-000000000001");
    store.allocate_session(&sess).await.unwrap();

    let found = store.get_session(&sess.id).await.unwrap();
    assert_eq!(found, sess);

    let err = store
        .get_session("00000000-0000-0000-0000-000012345678")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SessionNotFound));
}

#[tokio::test]
async fn recording_roundtrip_decompresses_in_order() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;
    let sid = "00000000-0000-0000-0000-000000000001";

    store
        .insert_session_recording(TENANT, sid, &gzip(b"ls -al\r\n"))
        .await
        .unwrap();
    store
        .insert_session_recording(TENANT, sid, &gzip(b"total 0\r\n"))
        .await
        .unwrap();

    let mut sink = Vec::new();
    store
        .get_session_recording(TENANT, sid, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink, b"ls -al\r\ntotal 0\r\n");
}

#[tokio::test]
async fn recording_streams_through_channel_sink() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;
    let sid = "00000000-0000-0000-0000-000000000002";

    store
        .insert_session_recording(TENANT, sid, &gzip(b"hello\n"))
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let mut sink = ChannelSink(tx);
    store
        .get_session_recording(TENANT, sid, &mut sink)
        .await
        .unwrap();
    drop(sink);

    let chunk = rx.recv().await.unwrap();
    assert_eq!(chunk, b"hello\n");
}

#[tokio::test]
async fn expired_recording_yields_no_data() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;
    let sid = "00000000-0000-0000-0000-000000000003";

    store
        .insert_session_recording(TENANT, sid, &gzip(b"ls -al\r\n"))
        .await
        .unwrap();

    // Jump past expire_ts (1h retention) plus grace.
    clock.advance(3_600_000 + 60_000);

    let mut sink = Vec::new();
    store
        .get_session_recording(TENANT, sid, &mut sink)
        .await
        .unwrap();
    assert!(sink.is_empty());

    // A new insert purges the expired row, then starts fresh.
    store
        .insert_session_recording(TENANT, sid, &gzip(b"fresh\n"))
        .await
        .unwrap();
    let mut sink = Vec::new();
    store
        .get_session_recording(TENANT, sid, &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, b"fresh\n");
}

#[tokio::test]
async fn recording_meta_is_stable_across_appends() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;
    let sid = "00000000-0000-0000-0000-000000000004";

    assert!(store
        .get_session_recording_meta(TENANT, sid)
        .await
        .unwrap()
        .is_none());

    store
        .insert_session_recording(TENANT, sid, &gzip(b"ls -al\r\n"))
        .await
        .unwrap();

    let meta = store
        .get_session_recording_meta(TENANT, sid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.session_id, sid);
    assert_eq!(meta.created_ts, 1_000);
    assert_eq!(meta.expire_ts, 1_000 + 3_600_000);

    // Later appends keep the id and the original timestamps.
    clock.set(2_000);
    store
        .insert_session_recording(TENANT, sid, &gzip(b"total 0\r\n"))
        .await
        .unwrap();

    let after = store
        .get_session_recording_meta(TENANT, sid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, meta);

    // Past expiry the metadata is gone with the data.
    clock.set(meta.expire_ts + 60_000);
    assert!(store
        .get_session_recording_meta(TENANT, sid)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn missing_recording_yields_no_data() {
    let clock = MockClock::shared(1_000);
    let store = store_at(&clock).await;

    let mut sink = Vec::new();
    store
        .get_session_recording(TENANT, "no-such-session", &mut sink)
        .await
        .unwrap();
    assert!(sink.is_empty());
}

#[tokio::test]
async fn custom_namespace_function_is_honored() {
    let clock = MockClock::shared(1_000);
    let plain = store_at(&clock).await;
    // Two handles over the same pool with different namespace
    // functions must not see each other's rows.
    let prefixed = plain
        .clone()
        .with_tenant_db_name(Arc::new(|tenant: &str| format!("acme-{tenant}")));

    prefixed.provision_device(TENANT, DEVICE).await.unwrap();

    assert!(plain.get_device(TENANT, DEVICE).await.unwrap().is_none());
    assert!(prefixed.get_device(TENANT, DEVICE).await.unwrap().is_some());
}

#[tokio::test]
async fn on_disk_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let clock = MockClock::shared(1_000);

    {
        let store = RelayStore::open(&path, clock.clone(), Duration::from_secs(3600))
            .await
            .unwrap();
        store.provision_device(TENANT, DEVICE).await.unwrap();
    }

    let store = RelayStore::open(&path, clock.clone(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(store.get_device(TENANT, DEVICE).await.unwrap().is_some());
}
