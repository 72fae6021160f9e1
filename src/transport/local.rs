//! In-process pub/sub broker
//!
//! `LocalHub` routes envelopes between `LocalTransport` endpoints that live in
//! the same process, keyed by device uuid. Messages for devices that are not
//! attached are dropped, as a broker drops messages for offline devices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{Transport, TransportEvent};
use crate::rpc::Envelope;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 1024;

/// Shared in-process broker
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    endpoints: Arc<Mutex<HashMap<String, broadcast::Sender<TransportEvent>>>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<TransportEvent>>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an endpoint for a device; it receives nothing until connected
    #[must_use]
    pub fn transport(&self, uuid: impl Into<String>) -> LocalTransport {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        LocalTransport {
            uuid: uuid.into(),
            hub: self.clone(),
            events,
            connected: AtomicBool::new(false),
        }
    }

    /// Uuids of currently attached devices
    #[must_use]
    pub fn attached(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self.lock().keys().cloned().collect();
        uuids.sort();
        uuids
    }

    /// Deliver a raw message to one device, bypassing envelope encoding
    ///
    /// Returns `false` if the device is not attached.
    pub fn deliver_raw(&self, uuid: &str, message: Value) -> bool {
        self.lock()
            .get(uuid)
            .is_some_and(|tx| tx.send(TransportEvent::Message(message)).is_ok())
    }

    /// Sever a device's connection from the broker side
    pub fn drop_connection(&self, uuid: &str) {
        if let Some(tx) = self.lock().remove(uuid) {
            tracing::debug!(uuid, "broker dropped connection");
            let _ = tx.send(TransportEvent::Disconnected);
        }
    }

    fn attach(&self, uuid: &str, events: broadcast::Sender<TransportEvent>) {
        self.lock().insert(uuid.to_string(), events);
    }

    fn detach(&self, uuid: &str) {
        self.lock().remove(uuid);
    }

    fn publish(&self, envelope: &Envelope) -> Result<usize> {
        let message = serde_json::to_value(envelope)?;
        let endpoints = self.lock();
        let mut delivered = 0;
        for uuid in envelope.devices.iter() {
            match endpoints.get(uuid) {
                Some(tx) if tx.send(TransportEvent::Message(message.clone())).is_ok() => {
                    delivered += 1;
                }
                _ => tracing::debug!(uuid, "no subscriber for device, message dropped"),
            }
        }
        Ok(delivered)
    }
}

/// One device's connection to a [`LocalHub`]
#[derive(Debug)]
pub struct LocalTransport {
    uuid: String,
    hub: LocalHub,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl LocalTransport {
    /// Device uuid this endpoint receives for
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self) -> Result<()> {
        self.hub.attach(&self.uuid, self.events.clone());
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Ready);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.hub.detach(&self.uuid);
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Transport(format!("{} is not connected", self.uuid)));
        }
        let delivered = self.hub.publish(envelope)?;
        tracing::trace!(from = %self.uuid, delivered, topic = ?envelope.topic, "envelope published");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.hub.lock().contains_key(&self.uuid)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
