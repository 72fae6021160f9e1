//! Request/response over a fire-and-forget transport
//!
//! Outbound calls carry a fresh correlation id and wait on a oneshot
//! receiver raced against the message timeout. Inbound envelopes enter
//! through [`VirtualDevice::on_message`], which either resolves a waiting
//! call (`RPC_BACK`) or dispatches to a registered command (`RPC_CALL`).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::commands::CommandRegistry;
use super::message::{
    Devices, Envelope, RET_TIMEOUT, RET_UNKNOWN_COMMAND, RET_VALIDATION_FAILED, RpcBackPayload,
    RpcCallPayload, Topic, peek_topic, validate_back, validate_call, validate_envelope,
};
use super::pending::PendingCalls;
use super::stats::{Statistics, StatusCommand};
use crate::configurator::Configurator;
use crate::transport::Transport;
use crate::{Error, Result};

/// Name of the command every device answers with its statistics
pub const STATUS_COMMAND: &str = "status";

struct Inner {
    uuid: String,
    transport: Arc<dyn Transport>,
    configurator: Configurator,
    commands: CommandRegistry,
    pending: Mutex<PendingCalls>,
    stats: Arc<Mutex<Statistics>>,
    fallback_timeout: Duration,
}

/// Removes a call's pending entry when the call ends, however it ends
///
/// Covers callers that drop the call future before it completes. Removal
/// is a no-op once a reply or timeout already took the entry.
struct PendingGuard<'a> {
    device: &'a VirtualDevice,
    callback_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.device.pending().cancel(self.callback_id) {
            tracing::debug!(callback_id = self.callback_id, "call abandoned before reply");
        }
    }
}

/// RPC endpoint for one mesh instance
///
/// Cheap to clone; clones share pending calls and statistics.
#[derive(Clone)]
pub struct VirtualDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("uuid", &self.inner.uuid)
            .field("transport", &self.inner.transport.name())
            .field("commands", &self.inner.commands)
            .finish_non_exhaustive()
    }
}

impl VirtualDevice {
    /// Build a device answering `commands` plus the built-in `status`
    ///
    /// `fallback_timeout` applies when the snapshot has no
    /// `transport_server.message_timeout`.
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        transport: Arc<dyn Transport>,
        configurator: Configurator,
        mut commands: CommandRegistry,
        fallback_timeout: Duration,
    ) -> Self {
        let stats = Arc::new(Mutex::new(Statistics::new()));
        if !commands.contains(STATUS_COMMAND) {
            commands.register(STATUS_COMMAND, StatusCommand::new(Arc::clone(&stats)));
        }

        Self {
            inner: Arc::new(Inner {
                uuid: uuid.into(),
                transport,
                configurator,
                commands,
                pending: Mutex::new(PendingCalls::new()),
                stats,
                fallback_timeout,
            }),
        }
    }

    /// This device's uuid
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// Configurator this device resolves services through
    #[must_use]
    pub fn configurator(&self) -> &Configurator {
        &self.inner.configurator
    }

    fn pending(&self) -> MutexGuard<'_, PendingCalls> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, Statistics> {
        self.inner.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Effective call timeout
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        self.inner
            .configurator
            .message_timeout()
            .unwrap_or(self.inner.fallback_timeout)
    }

    /// Call a remote command and wait for its reply
    ///
    /// A call that gets no reply within the message timeout resolves with a
    /// `200003` reply rather than an error.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the envelope
    pub async fn call(
        &self,
        target: impl Into<Devices>,
        payload: RpcCallPayload,
    ) -> Result<RpcBackPayload> {
        let timeout = self.message_timeout();
        self.call_with_timeout(target, payload, timeout).await
    }

    /// [`VirtualDevice::call`] with an explicit timeout
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the envelope
    pub async fn call_with_timeout(
        &self,
        target: impl Into<Devices>,
        payload: RpcCallPayload,
        timeout: Duration,
    ) -> Result<RpcBackPayload> {
        let (callback_id, mut rx) = self.pending().prepare();
        let _guard = PendingGuard {
            device: self,
            callback_id: &callback_id,
        };
        let envelope = Envelope::call(target, &self.inner.uuid, Some(callback_id.clone()), &payload);

        if let Err(e) = self.inner.transport.send(&envelope).await {
            tracing::error!(error_id = e.error_id(), error = %e, cmd = %payload.cmd_name, "failed to send call");
            return Err(e);
        }
        self.stats().record_sent();
        tracing::trace!(callback_id = %callback_id, cmd = %payload.cmd_name, "call sent");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => {
                let timed_out = self.pending().cancel(&callback_id);
                if !timed_out {
                    // The reply won the race after the timer fired
                    if let Ok(reply) = rx.try_recv() {
                        return Ok(reply);
                    }
                }
                self.stats().record_timeout();
                tracing::error!(
                    error_id = RET_TIMEOUT,
                    callback_id = %callback_id,
                    cmd = %payload.cmd_name,
                    timeout_secs = timeout.as_secs_f64(),
                    "call timed out"
                );
                Ok(RpcBackPayload::timeout(&callback_id, timeout.as_secs_f64()))
            }
        }
    }

    /// Send a call without waiting for a reply
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the envelope
    pub async fn send(&self, target: impl Into<Devices>, payload: RpcCallPayload) -> Result<()> {
        let envelope = Envelope::call(target, &self.inner.uuid, None, &payload);
        self.inner.transport.send(&envelope).await.inspect_err(|e| {
            tracing::error!(error_id = e.error_id(), error = %e, cmd = %payload.cmd_name, "failed to send message");
        })?;
        self.stats().record_sent();
        Ok(())
    }

    /// Call a command on a random online instance of `service`
    ///
    /// # Errors
    ///
    /// Returns `Error::ServiceUnavailable` if no instance is online, or the
    /// transport error if sending fails
    pub async fn call_service(&self, service: &str, payload: RpcCallPayload) -> Result<RpcBackPayload> {
        let target = self
            .inner
            .configurator
            .get_config_value_random(&format!("services.{service}"))
            .ok_or_else(|| Error::ServiceUnavailable(service.to_string()))?;
        tracing::debug!(service, target = %target, cmd = %payload.cmd_name, "routing call");
        self.call(target, payload).await
    }

    /// Single inbound entry point for transport messages
    pub async fn on_message(&self, raw: Value) {
        let envelope = match validate_envelope(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error_id = RET_VALIDATION_FAILED, error = %err, "invalid envelope");
                if peek_topic(&raw) == Some(Topic::RpcCall) {
                    self.reply_invalid_call(&raw, &RpcBackPayload::validation(&err))
                        .await;
                }
                return;
            }
        };

        match envelope.topic {
            Topic::RpcBack => self.handle_back(&envelope),
            Topic::RpcCall => self.handle_call(envelope).await,
        }
    }

    /// Best-effort reply to a call whose envelope failed validation
    async fn reply_invalid_call(&self, raw: &Value, reply: &RpcBackPayload) {
        let Some(from) = raw.get("fromUuid").and_then(Value::as_str) else {
            tracing::warn!("invalid call has no sender to reply to");
            return;
        };
        let callback_id = raw
            .get("callbackId")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        self.reply(from, callback_id, reply).await;
    }

    async fn reply(&self, to: &str, callback_id: Option<String>, payload: &RpcBackPayload) {
        let envelope = Envelope::back(to, &self.inner.uuid, callback_id, payload);
        if let Err(e) = self.inner.transport.send(&envelope).await {
            tracing::error!(error_id = e.error_id(), error = %e, to, "failed to send reply");
        }
    }

    fn handle_back(&self, envelope: &Envelope) {
        let reply = match validate_back(&envelope.payload) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(error_id = RET_VALIDATION_FAILED, error = %err, from = %envelope.from_uuid, "invalid reply payload");
                return;
            }
        };

        let Some(callback_id) = envelope.callback_id.as_deref() else {
            tracing::debug!(from = %envelope.from_uuid, "reply without callback id ignored");
            return;
        };

        let latency = self.pending().resolve(callback_id, reply);
        match latency {
            Some(latency) => self.stats().record_reply(latency),
            None => tracing::debug!(callback_id, "no pending call for reply"),
        }
    }

    async fn handle_call(&self, envelope: Envelope) {
        let call = match validate_call(&envelope.payload) {
            Ok(call) => call,
            Err(err) => {
                tracing::error!(error_id = RET_VALIDATION_FAILED, error = %err, from = %envelope.from_uuid, "invalid call payload");
                self.reply(
                    &envelope.from_uuid,
                    envelope.callback_id,
                    &RpcBackPayload::validation(&err),
                )
                .await;
                return;
            }
        };

        let Some(handler) = self.inner.commands.get(&call.cmd_name) else {
            tracing::error!(error_id = RET_UNKNOWN_COMMAND, cmd = %call.cmd_name, from = %envelope.from_uuid, "unknown command");
            self.reply(
                &envelope.from_uuid,
                envelope.callback_id,
                &RpcBackPayload::unknown_command(&call.cmd_name),
            )
            .await;
            return;
        };

        tracing::debug!(cmd = %call.cmd_name, cmd_code = %call.cmd_code, from = %envelope.from_uuid, "dispatching call");
        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let reply = handler.handle(call.parameters).await;
            this.stats().record_inbound(started.elapsed());

            if let Some(callback_id) = envelope.callback_id {
                this.reply(&envelope.from_uuid, Some(callback_id), &reply)
                    .await;
            }
        });
    }

    /// Statistics, optionally filtered to the named counters
    #[must_use]
    pub fn status(&self, selector: Option<&[String]>) -> Map<String, Value> {
        self.stats().status(selector)
    }

    /// Number of calls waiting for a reply
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Registered command names, including `status`
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.inner.commands.names()
    }

    /// Fold the statistics window every `interval`
    ///
    /// A zero interval disables the refresh; averages then stay at zero.
    pub fn spawn_stats_refresh(&self, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(&self.inner.stats);
        let uuid = self.inner.uuid.clone();
        if interval.is_zero() {
            tracing::warn!(uuid = %uuid, "stats interval is zero, refresh disabled");
            return tokio::spawn(async {});
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let snapshot = {
                    let mut stats = stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.fold();
                    stats.to_map()
                };
                tracing::debug!(uuid = %uuid, stats = %serde_json::Value::Object(snapshot), "statistics refreshed");
            }
        })
    }
}
