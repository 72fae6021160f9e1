//! Device Mesh - service discovery and RPC for cooperating virtual devices
//!
//! This library provides the core of a mesh node:
//! - Watch-driven mirror of the coordination tree (server endpoints,
//!   service topology, instance liveness) with atomic local persistence
//! - Random load-balancing over online instances of a service
//! - Correlated request/response, command dispatch and statistics over a
//!   pub/sub transport
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        Node                           │
//! │   identity  │  registration  │  transport event loop  │
//! └───────┬──────────────────────────────────┬───────────┘
//!         │                                  │
//! ┌───────▼──────────────┐      ┌────────────▼───────────┐
//! │     Configurator     │◄─────┤     VirtualDevice      │
//! │ snapshot │ watches   │      │ calls │ dispatch │ stats│
//! └───────┬──────────────┘      └────────────┬───────────┘
//!         │                                  │
//! ┌───────▼──────────────┐      ┌────────────▼───────────┐
//! │  CoordinationClient  │      │       Transport        │
//! └──────────────────────┘      └────────────────────────┘
//! ```

pub mod config;
pub mod configurator;
pub mod coordination;
pub mod error;
pub mod node;
pub mod rpc;
pub mod transport;

pub use config::Config;
pub use configurator::{ConnectionState, Configurator, InstanceIdentity};
pub use coordination::{CoordinationClient, MemoryCoordination};
pub use error::{Error, Result};
pub use node::Node;
pub use rpc::{CommandRegistry, RpcBackPayload, RpcCallPayload, VirtualDevice};
pub use transport::{LocalHub, LocalTransport, Transport, TransportEvent};
