//! Shared test utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use device_mesh::configurator::{ConfigSnapshot, ConfiguratorOptions};
use device_mesh::rpc::CommandRegistry;
use device_mesh::transport::TransportEvent;
use device_mesh::{Configurator, LocalHub, MemoryCoordination, Transport, VirtualDevice};

/// Store with a `transport_server` section
#[must_use]
pub fn seeded_store() -> Arc<MemoryCoordination> {
    let store = Arc::new(MemoryCoordination::new());
    store.put("/system/transport_server/host", "m2m.local");
    store.put("/system/transport_server/port", "3000");
    store.put("/system/transport_server/message_timeout", "5");
    store
}

/// Publish an instance the way a registering node would
pub fn put_instance(store: &MemoryCoordination, service: &str, uuid: &str, online: &str) {
    let base = format!("/system/services/{service}/cluster/{uuid}");
    store.put(&format!("{base}/uuid"), uuid);
    store.put(&format!("{base}/token"), "token");
    store.put(&format!("{base}/online"), online);
}

/// Liveness leaf path
#[must_use]
pub fn online_leaf(service: &str, uuid: &str) -> String {
    format!("/system/services/{service}/cluster/{uuid}/online")
}

/// Options with short timings for tests
#[must_use]
pub fn fast_options() -> ConfiguratorOptions {
    ConfiguratorOptions {
        connect_timeout: Duration::from_secs(1),
        watch_retry: Duration::from_millis(20),
        ..ConfiguratorOptions::default()
    }
}

/// Configurator persisting into `dir`
#[must_use]
pub fn configurator_in(store: Arc<MemoryCoordination>, dir: &Path) -> Configurator {
    Configurator::new(
        store,
        ConfigSnapshot::with_path(dir.join("snapshot.json")),
        fast_options(),
    )
}

/// Configurator over an unconnected store, serving only `snapshot`
#[must_use]
pub fn offline_configurator(snapshot: ConfigSnapshot) -> Configurator {
    Configurator::new(Arc::new(MemoryCoordination::new()), snapshot, fast_options())
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Connect a device to the hub and pump its inbound messages
pub async fn spawn_device(
    hub: &LocalHub,
    uuid: &str,
    configurator: Configurator,
    commands: CommandRegistry,
    timeout: Duration,
) -> VirtualDevice {
    let transport = Arc::new(hub.transport(uuid));
    let mut events = transport.subscribe();
    transport.connect().await.expect("local connect");

    let device = VirtualDevice::new(uuid, transport, configurator, commands, timeout);
    let pump = device.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let TransportEvent::Message(raw) = event {
                pump.on_message(raw).await;
            }
        }
    });
    device
}
