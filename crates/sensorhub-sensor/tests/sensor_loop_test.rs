//! Integration tests for the sensor run loop against a scripted central

use sensorhub_proto::{
    CapabilitySet, ClusterConfig, Compression, EventAction, HubMessage, ManagedConfigInit,
    NetworkBaselineSync, PolicySync, SensorEvent, StreamMetadata, MANAGED_CONFIG_SUPPORT_KEY,
};
use sensorhub_sensor::{
    ClusterIdCache, InMemorySensorState, MemoryClusterIdCache, ReconnectConfig, Sensor,
    SensorConfig,
};
use sensorhub_transport::{memory, HubStream, IncomingStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        max_attempts: None,
    }
}

/// Accept a stream and play central's side of the handshake
async fn central_handshake(incoming: IncomingStream, cluster_id: &str) -> HubStream {
    let mut header = StreamMetadata::new();
    header.set_bool(MANAGED_CONFIG_SUPPORT_KEY, true);
    header.set_capabilities(&CapabilitySet::all());

    let managed = incoming.request_metadata().managed_config_support().unwrap();
    let mut stream = incoming.accept(header).unwrap();

    if managed {
        match stream.recv_message().await.unwrap() {
            Some(HubMessage::HelmManagedConfigInit(_)) => {}
            other => panic!("Expected HelmManagedConfigInit, got {:?}", other),
        }
    }

    for message in [
        HubMessage::ClusterConfig(ClusterConfig {
            cluster_id: cluster_id.to_string(),
            cluster_name: "prod".to_string(),
            ..Default::default()
        }),
        HubMessage::PolicySync(PolicySync::default()),
        HubMessage::NetworkBaselineSync(NetworkBaselineSync::default()),
    ] {
        stream.send_message(&message).await.unwrap();
    }
    stream
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sensor_answers_ping_and_upgrade_trigger() {
    init_tracing();

    let (dialer, mut listener) = memory::listener([Compression::Gzip, Compression::None]);
    let state = Arc::new(InMemorySensorState::new());
    let cache = Arc::new(MemoryClusterIdCache::new());

    let (sensor, handle) = Sensor::new(
        SensorConfig::new("prod").with_reconnect(fast_reconnect()),
        Arc::new(dialer),
        state.clone(),
        cache.clone(),
    );
    let sensor_task = tokio::spawn(sensor.run());

    let incoming = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("sensor never dialed")
        .unwrap();
    assert_eq!(incoming.compression(), Compression::Gzip);
    let mut stream = central_handshake(incoming, "c-1").await;

    stream
        .send_message(&HubMessage::Ping { timestamp: 42 })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Some(HubMessage::Pong { timestamp: 42 }));

    stream
        .send_message(&HubMessage::UpgradeTrigger {
            process_id: "up-1".to_string(),
            target_version: "4.5.0".to_string(),
        })
        .await
        .unwrap();

    handle
        .send_event(SensorEvent {
            event_id: "e-1".to_string(),
            resource: "Deployment".to_string(),
            action: EventAction::Create,
            payload: serde_json::json!({"name": "nginx"}),
        })
        .await;
    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(HubMessage::SensorEvent(event)) => assert_eq!(event.event_id, "e-1"),
        other => panic!("Expected SensorEvent, got {:?}", other),
    }

    assert_eq!(state.snapshot().upgrades.len(), 1);
    assert_eq!(cache.load().unwrap(), Some("c-1".to_string()));

    handle.shutdown();
    match timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .unwrap()
        .unwrap()
    {
        Some(HubMessage::Disconnect { reason }) => assert!(reason.contains("shutdown")),
        other => panic!("Expected Disconnect, got {:?}", other),
    }

    timeout(Duration::from_secs(5), sensor_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sensor_renegotiates_after_stream_loss() {
    init_tracing();

    // Central without gzip: every session falls back to no compression
    let (dialer, mut listener) = memory::listener([Compression::None]);
    let state = Arc::new(InMemorySensorState::new());
    let cache = Arc::new(MemoryClusterIdCache::with_id("cached"));

    let config = SensorConfig::new("prod")
        .with_reconnect(fast_reconnect())
        .with_managed_config(ManagedConfigInit {
            cluster_name: "prod".to_string(),
            ..Default::default()
        });

    let (sensor, handle) = Sensor::new(config, Arc::new(dialer), state.clone(), cache);
    let sensor_task = tokio::spawn(sensor.run());

    for session in 1..=2 {
        let incoming = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("sensor never dialed")
            .unwrap();
        assert_eq!(incoming.compression(), Compression::None);
        let stream = central_handshake(incoming, "cached").await;

        // Wait until the sensor applied the handshake, then cut the stream
        timeout(Duration::from_secs(5), async {
            while state.snapshot().config_applications < session {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        drop(stream);
    }

    assert_eq!(state.snapshot().config_applications, 2);

    handle.shutdown();
    timeout(Duration::from_secs(5), sensor_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
