//! Pub/sub transport adapters
//!
//! A transport delivers envelopes to devices by uuid and reports its
//! connection lifecycle as [`TransportEvent`]s. Delivery is at-least-once
//! with no ordering guarantee across targets; request/response is layered on
//! top by [`crate::rpc::VirtualDevice`].

pub mod local;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

pub use local::{LocalHub, LocalTransport};

use crate::Result;
use crate::rpc::Envelope;

/// Lifecycle and delivery events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established, messages can flow
    Ready,
    /// Raw inbound message, not yet validated
    Message(Value),
    /// Connection-level failure
    Error(String),
    /// Connection closed
    Disconnected,
}

/// Trait for pub/sub transport connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Start connecting; success is reported as [`TransportEvent::Ready`]
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Publish an envelope to the devices it names
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
