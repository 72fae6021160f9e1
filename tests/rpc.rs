//! RPC integration tests
//!
//! Devices talk over an in-process hub; a bare "observer" endpoint stands
//! in for a misbehaving peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use device_mesh::configurator::{ConfigSnapshot, ServiceRegistryEntry};
use device_mesh::rpc::{
    CommandRegistry, Envelope, RET_OK, RET_TIMEOUT, RET_UNKNOWN_COMMAND, RET_VALIDATION_FAILED,
    RpcBackPayload, RpcCallPayload, Topic,
};
use device_mesh::transport::TransportEvent;
use device_mesh::{Error, LocalHub, LocalTransport, Transport, VirtualDevice};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

mod common;
use common::{eventually, offline_configurator, spawn_device};

const TIMEOUT: Duration = Duration::from_secs(1);

fn echo_commands() -> CommandRegistry {
    CommandRegistry::new()
        .with_fn("echo", |params| async move { RpcBackPayload::ok(params) })
        .with_fn("slow", |params| async move {
            let millis = params["millis"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            RpcBackPayload::ok(json!({ "slept": millis }))
        })
}

async fn pair(hub: &LocalHub) -> (VirtualDevice, VirtualDevice) {
    let a = spawn_device(
        hub,
        "a",
        offline_configurator(ConfigSnapshot::default()),
        CommandRegistry::new(),
        TIMEOUT,
    )
    .await;
    let b = spawn_device(
        hub,
        "b",
        offline_configurator(ConfigSnapshot::default()),
        echo_commands(),
        TIMEOUT,
    )
    .await;
    (a, b)
}

/// Raw endpoint that records whatever it receives
async fn observer(hub: &LocalHub) -> (LocalTransport, broadcast::Receiver<TransportEvent>) {
    let transport = hub.transport("observer");
    let events = transport.subscribe();
    transport.connect().await.unwrap();
    (transport, events)
}

async fn next_message(events: &mut broadcast::Receiver<TransportEvent>) -> Option<Value> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Message(raw)) => return Some(raw),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_millis(200), wait)
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn call_returns_reply() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let reply = a
        .call("b", RpcCallPayload::new("echo", "0001", json!({ "n": 7 })))
        .await
        .unwrap();

    assert_eq!(reply.ret_code, RET_OK);
    assert_eq!(reply.data, json!({ "n": 7 }));
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.status(None)["outboundTotal"], 1);
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let reply = a
        .call("b", RpcCallPayload::new("ping", "0001", json!({})))
        .await
        .unwrap();

    assert_eq!(reply.ret_code, RET_UNKNOWN_COMMAND);
    assert_eq!(reply.description, "method name=ping");
}

#[tokio::test(start_paused = true)]
async fn silent_target_times_out() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let started = tokio::time::Instant::now();
    let reply = a
        .call_with_timeout("ghost", RpcCallPayload::new("echo", "0001", json!({})), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(reply.ret_code, RET_TIMEOUT);
    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.status(None)["timeoutTotal"], 1);
}

#[tokio::test(start_paused = true)]
async fn reply_before_deadline_wins() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let reply = a
        .call_with_timeout(
            "b",
            RpcCallPayload::new("slow", "0001", json!({ "millis": 900 })),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert!(reply.is_ok());
    assert_eq!(reply.data["slept"], 900);
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_discarded() {
    let hub = LocalHub::new();
    let (a, b) = pair(&hub).await;

    let reply = a
        .call_with_timeout(
            "b",
            RpcCallPayload::new("slow", "0001", json!({ "millis": 1500 })),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(reply.ret_code, RET_TIMEOUT);

    // Let the handler finish and its reply arrive with nobody waiting
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(b.status(None)["inboundTotal"], 1);
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.status(None)["timeoutTotal"], 1);
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let calls = (0..20).map(|n| {
        let a = a.clone();
        tokio::spawn(async move {
            let reply = a
                .call("b", RpcCallPayload::new("echo", "0001", json!({ "n": n })))
                .await
                .unwrap();
            (n, reply)
        })
    });

    for call in futures::future::join_all(calls).await {
        let (n, reply) = call.unwrap();
        assert_eq!(reply.data["n"], n);
    }
    assert_eq!(a.pending_calls(), 0);
}

#[tokio::test]
async fn invalid_call_payload_gets_validation_reply() {
    let hub = LocalHub::new();
    let (_a, _b) = pair(&hub).await;
    let (_endpoint, mut observed) = observer(&hub).await;

    hub.deliver_raw(
        "b",
        json!({
            "devices": "b",
            "topic": "RPC_CALL",
            "fromUuid": "observer",
            "callbackId": "cb-1",
            "payload": { "cmdName": "echo", "parameters": {} }
        }),
    );

    let raw = next_message(&mut observed).await.expect("validation reply");
    let reply: Envelope = serde_json::from_value(raw).unwrap();
    assert_eq!(reply.topic, Topic::RpcBack);
    assert_eq!(reply.callback_id.as_deref(), Some("cb-1"));
    assert_eq!(reply.payload["retCode"], RET_VALIDATION_FAILED);
    assert_eq!(
        reply.payload["description"],
        "Missing required property: cmdCode"
    );
}

#[tokio::test]
async fn invalid_call_envelope_gets_validation_reply() {
    let hub = LocalHub::new();
    let (_a, _b) = pair(&hub).await;
    let (_endpoint, mut observed) = observer(&hub).await;

    hub.deliver_raw(
        "b",
        json!({
            "topic": "RPC_CALL",
            "fromUuid": "observer",
            "payload": { "cmdName": "echo", "cmdCode": "1", "parameters": {} }
        }),
    );

    let raw = next_message(&mut observed).await.expect("validation reply");
    assert_eq!(raw["payload"]["retCode"], RET_VALIDATION_FAILED);
    assert_eq!(raw["payload"]["data"]["message"], "Missing required property: devices");
}

#[tokio::test]
async fn invalid_reply_is_only_logged() {
    let hub = LocalHub::new();
    let (_a, _b) = pair(&hub).await;
    let (_endpoint, mut observed) = observer(&hub).await;

    hub.deliver_raw(
        "b",
        json!({
            "devices": "b",
            "topic": "RPC_BACK",
            "fromUuid": "observer",
            "callbackId": "cb-2",
            "payload": { "retCode": "oops" }
        }),
    );

    assert!(next_message(&mut observed).await.is_none());
}

#[tokio::test]
async fn fire_and_forget_gets_no_reply() {
    let hub = LocalHub::new();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let commands = CommandRegistry::new().with_fn("log", move |params| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(params);
            RpcBackPayload::ok(Value::Null)
        }
    });
    let _sink = spawn_device(
        &hub,
        "sink",
        offline_configurator(ConfigSnapshot::default()),
        commands,
        TIMEOUT,
    )
    .await;
    let (_endpoint, mut observed) = observer(&hub).await;

    let sender = hub.transport("sender");
    sender.connect().await.unwrap();
    let envelope = Envelope::call(
        "sink",
        "observer",
        None,
        &RpcCallPayload::new("log", "0003", json!({ "line": "hello" })),
    );
    sender.send(&envelope).await.unwrap();

    let params = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params["line"], "hello");
    assert!(next_message(&mut observed).await.is_none());
}

#[tokio::test]
async fn device_send_counts_outbound() {
    let hub = LocalHub::new();
    let (a, b) = pair(&hub).await;

    a.send("b", RpcCallPayload::new("echo", "0001", json!(1)))
        .await
        .unwrap();

    assert!(eventually(|| b.status(None)["inboundTotal"] == 1).await);
    assert_eq!(a.status(None)["outboundTotal"], 1);
    assert_eq!(a.pending_calls(), 0);
}

#[tokio::test]
async fn status_command_is_built_in() {
    let hub = LocalHub::new();
    let (a, b) = pair(&hub).await;
    assert!(b.commands().contains(&"status".to_string()));

    a.call("b", RpcCallPayload::new("echo", "0001", json!(null)))
        .await
        .unwrap();
    let reply = a
        .call(
            "b",
            RpcCallPayload::new("status", "0000", json!(["inboundTotal"])),
        )
        .await
        .unwrap();

    assert!(reply.is_ok());
    assert_eq!(reply.data, json!({ "inboundTotal": 1 }));

    let names = vec!["timeoutTotal".to_string()];
    assert_eq!(
        a.status(Some(names.as_slice())),
        serde_json::Map::from_iter([("timeoutTotal".to_string(), json!(0))])
    );
}

#[tokio::test]
async fn call_service_routes_to_online_instance() {
    let hub = LocalHub::new();
    let mut snapshot = ConfigSnapshot::default();
    snapshot.upsert_service_entry("echo_service", ServiceRegistryEntry::new("b", "true"));
    snapshot.upsert_service_entry("echo_service", ServiceRegistryEntry::new("c", "false"));
    let a = spawn_device(
        &hub,
        "a",
        offline_configurator(snapshot),
        CommandRegistry::new(),
        TIMEOUT,
    )
    .await;
    let _b = spawn_device(
        &hub,
        "b",
        offline_configurator(ConfigSnapshot::default()),
        echo_commands(),
        TIMEOUT,
    )
    .await;

    for n in 0..10 {
        let reply = a
            .call_service("echo_service", RpcCallPayload::new("echo", "0001", json!(n)))
            .await
            .unwrap();
        assert_eq!(reply.data, json!(n));
    }

    let missing = a
        .call_service("nobody", RpcCallPayload::new("echo", "0001", json!(0)))
        .await;
    assert!(matches!(missing, Err(Error::ServiceUnavailable(name)) if name == "nobody"));
}

#[tokio::test]
async fn message_timeout_follows_snapshot() {
    let mut snapshot = ConfigSnapshot::default();
    snapshot.set_section("transport_server", json!({ "message_timeout": 2 }));
    let hub = LocalHub::new();

    let device = spawn_device(
        &hub,
        "a",
        offline_configurator(snapshot),
        CommandRegistry::new(),
        TIMEOUT,
    )
    .await;
    assert_eq!(device.message_timeout(), Duration::from_secs(2));

    let fallback = spawn_device(
        &hub,
        "b",
        offline_configurator(ConfigSnapshot::default()),
        CommandRegistry::new(),
        TIMEOUT,
    )
    .await;
    assert_eq!(fallback.message_timeout(), TIMEOUT);
}

/// Transport that refuses every send
struct BrokenTransport {
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for BrokenTransport {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn connect(&self) -> device_mesh::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> device_mesh::Result<()> {
        Ok(())
    }

    async fn send(&self, _envelope: &Envelope) -> device_mesh::Result<()> {
        Err(Error::Transport("link down".to_string()))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[tokio::test]
async fn send_failure_clears_pending_call() {
    let (events, _) = broadcast::channel(4);
    let device = VirtualDevice::new(
        "a",
        Arc::new(BrokenTransport { events }),
        offline_configurator(ConfigSnapshot::default()),
        CommandRegistry::new(),
        TIMEOUT,
    );

    let result = device
        .call("b", RpcCallPayload::new("echo", "0001", json!({})))
        .await;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(device.pending_calls(), 0);
    assert_eq!(device.status(None)["outboundTotal"], 0);
}

#[tokio::test(start_paused = true)]
async fn stats_refresh_folds_window() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;
    a.call("b", RpcCallPayload::new("echo", "0001", json!(null)))
        .await
        .unwrap();
    assert!(a.status(None)["refreshedAt"].is_null());

    let refresher = a.spawn_stats_refresh(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(61)).await;

    let status = a.status(None);
    assert!(status["refreshedAt"].is_string());
    assert_eq!(status["outboundAvgMs"], 0);
    assert_eq!(status["outboundTotal"], 1);
    refresher.abort();
}

#[tokio::test(start_paused = true)]
async fn abandoned_call_clears_pending_entry() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let call = a.call_with_timeout(
        "ghost",
        RpcCallPayload::new("echo", "0001", json!({})),
        Duration::from_secs(5),
    );
    let abandoned = tokio::time::timeout(Duration::from_millis(100), call).await;
    assert!(abandoned.is_err());
    assert_eq!(a.pending_calls(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(a.pending_calls(), 0);
    assert_eq!(a.status(None)["timeoutTotal"], 0);
}

#[tokio::test(start_paused = true)]
async fn zero_stats_interval_disables_refresh() {
    let hub = LocalHub::new();
    let (a, _b) = pair(&hub).await;

    let refresher = a.spawn_stats_refresh(Duration::ZERO);
    tokio_test::assert_ok!(refresher.await);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(a.status(None)["refreshedAt"].is_null());
}
