//! Node lifecycle tests over the in-process store and hub

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use device_mesh::config::file::MeshConfigFile;
use device_mesh::configurator::InstanceIdentity;
use device_mesh::{
    CommandRegistry, Config, LocalHub, MemoryCoordination, Node, RpcBackPayload, RpcCallPayload,
    Transport,
};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

mod common;
use common::{eventually, online_leaf, seeded_store};

fn node_config(dir: &Path, service: &str, uuid: Option<&str>) -> Config {
    let mut config = Config::from_file(MeshConfigFile::default());
    config.identity.service = service.to_string();
    config.identity.uuid = uuid.map(ToString::to_string);
    config.snapshot_path = dir.join(format!("{service}.json"));
    config.coordination.connect_timeout = Duration::from_secs(1);
    config.reconnect_delay = Duration::from_millis(200);
    config
}

async fn start(
    store: &Arc<MemoryCoordination>,
    hub: &LocalHub,
    config: Config,
    commands: CommandRegistry,
) -> Arc<Node> {
    let hub = hub.clone();
    let node = Node::start(
        config,
        store.clone(),
        commands,
        move |identity: &InstanceIdentity| -> Arc<dyn Transport> {
            Arc::new(hub.transport(identity.uuid.clone()))
        },
    )
    .await
    .unwrap();
    Arc::new(node)
}

fn run(node: &Arc<Node>) -> (oneshot::Sender<()>, JoinHandle<device_mesh::Result<()>>) {
    let (tx, rx) = oneshot::channel();
    let runner = Arc::clone(node);
    let task = tokio::spawn(async move {
        runner
            .run_until(async move {
                let _ = rx.await;
            })
            .await
    });
    (tx, task)
}

#[tokio::test]
async fn node_goes_online_and_back_offline() {
    let store = seeded_store();
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let node = start(
        &store,
        &hub,
        node_config(dir.path(), "device_manager", Some("dm-1")),
        CommandRegistry::new(),
    )
    .await;

    let leaf = online_leaf("device_manager", "dm-1");
    assert_eq!(store.read(&leaf).as_deref(), Some("false"));
    assert_eq!(
        node.configurator().get_config_value("self.uuid"),
        Some(json!("dm-1"))
    );

    let (shutdown, task) = run(&node);
    assert!(eventually(|| store.read(&leaf).as_deref() == Some("true")).await);
    assert!(
        eventually(|| node.configurator().get_config_value_random("services.device_manager")
            == Some("dm-1".to_string()))
        .await
    );

    shutdown.send(()).unwrap();
    tokio_test::assert_ok!(task.await.unwrap());
    assert_eq!(store.read(&leaf).as_deref(), Some("false"));
    assert!(hub.attached().is_empty());
}

#[tokio::test]
async fn dropped_connection_reconnects() {
    let store = seeded_store();
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let node = start(
        &store,
        &hub,
        node_config(dir.path(), "device_manager", Some("dm-1")),
        CommandRegistry::new(),
    )
    .await;
    let leaf = online_leaf("device_manager", "dm-1");

    let (shutdown, task) = run(&node);
    assert!(eventually(|| store.read(&leaf).as_deref() == Some("true")).await);

    hub.drop_connection("dm-1");
    assert!(eventually(|| store.read(&leaf).as_deref() == Some("false")).await);
    assert!(eventually(|| store.read(&leaf).as_deref() == Some("true")).await);
    assert_eq!(hub.attached(), vec!["dm-1".to_string()]);

    shutdown.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn nodes_call_each_other_by_service() {
    let store = seeded_store();
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();

    let manager = start(
        &store,
        &hub,
        node_config(dir.path(), "device_manager", Some("dm-1")),
        CommandRegistry::new(),
    )
    .await;
    let engine = start(
        &store,
        &hub,
        node_config(dir.path(), "flow_engine", Some("fe-1")),
        CommandRegistry::new().with_fn("run_flow", |params| async move {
            RpcBackPayload::ok(json!({ "flow": params["flow"], "state": "started" }))
        }),
    )
    .await;

    let (stop_manager, manager_task) = run(&manager);
    let (stop_engine, engine_task) = run(&engine);

    assert!(
        eventually(|| manager
            .configurator()
            .get_config_value_random("services.flow_engine")
            == Some("fe-1".to_string()))
        .await
    );

    let reply = manager
        .device()
        .call_service(
            "flow_engine",
            RpcCallPayload::new("run_flow", "0100", json!({ "flow": "daily" })),
        )
        .await
        .unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.data, json!({ "flow": "daily", "state": "started" }));
    assert_eq!(engine.device().status(None)["inboundTotal"], 1);

    stop_manager.send(()).unwrap();
    stop_engine.send(()).unwrap();
    manager_task.await.unwrap().unwrap();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn generated_identity_survives_restart() {
    let store = seeded_store();
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();

    let first = start(
        &store,
        &hub,
        node_config(dir.path(), "device_manager", None),
        CommandRegistry::new(),
    )
    .await;
    let uuid = first.identity().uuid.clone();
    let token = first.identity().token.clone();
    assert!(!uuid.is_empty());
    drop(first);

    let second = start(
        &store,
        &hub,
        node_config(dir.path(), "device_manager", None),
        CommandRegistry::new(),
    )
    .await;
    assert_eq!(second.identity().uuid, uuid);
    assert_eq!(second.identity().token, token);
    assert_eq!(
        store
            .read(&format!("/system/services/device_manager/cluster/{uuid}/token"))
            .as_deref(),
        Some(token.as_str())
    );
}

#[tokio::test]
async fn zero_stats_interval_is_rejected_before_registering() {
    let store = seeded_store();
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "device_manager", Some("dm-1"));
    config.rpc.stats_interval = Duration::ZERO;

    let result = Node::start(
        config,
        store.clone(),
        CommandRegistry::new(),
        move |identity: &InstanceIdentity| -> Arc<dyn Transport> {
            Arc::new(hub.transport(identity.uuid.clone()))
        },
    )
    .await;

    assert!(matches!(result, Err(device_mesh::Error::Config(msg)) if msg.contains("stats_interval")));
    assert!(store
        .read("/system/services/device_manager/cluster/dm-1/online")
        .is_none());
}
