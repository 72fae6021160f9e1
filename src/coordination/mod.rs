//! Coordination service client interface
//!
//! The mesh keeps its topology in a hierarchical node store with
//! single-fire watches (ZooKeeper-style). Implementations live behind the
//! `CoordinationClient` trait; `MemoryCoordination` is an in-process store
//! for local meshes and tests.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

pub use memory::MemoryCoordination;

use crate::Result;

/// Session-level events emitted by a coordination client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session established with read/write access
    Connected,
    /// Session established, server is read-only
    ConnectedReadOnly,
    /// Session lost; outstanding watches are dropped
    Disconnected,
    /// Credentials rejected
    AuthFailed,
}

/// What changed on a watched node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Notification delivered by a fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// A single-fire watch
///
/// Resolves once with the event. Resolves with an error if the session that
/// armed it is lost before the node changes.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// One operation in a multi-node transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Create a persistent node with optional data
    Create { path: String, data: Option<Vec<u8>> },
}

impl TxnOp {
    /// Create op with UTF-8 text data
    #[must_use]
    pub fn create(path: impl Into<String>, data: Option<&str>) -> Self {
        Self::Create {
            path: path.into(),
            data: data.map(|d| d.as_bytes().to_vec()),
        }
    }
}

/// Hierarchical node store with watches and transactions
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Subscribe to session events
    ///
    /// Subscribe before calling [`CoordinationClient::connect`] so the
    /// outcome of that attempt is not missed.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Begin establishing a session; the outcome arrives as a [`SessionEvent`]
    fn connect(&self);

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;

    /// List the children of a node
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// List the children of a node and watch for membership changes
    async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Read a node's data as UTF-8 text
    async fn get_data(&self, path: &str) -> Result<String>;

    /// Read a node's data and watch it for changes or deletion
    async fn get_data_watched(&self, path: &str) -> Result<(String, Watch)>;

    /// Check whether a node exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Overwrite a node's data
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create a persistent node, returning its path
    async fn create(&self, path: &str, data: Option<&[u8]>) -> Result<String>;

    /// Apply all operations atomically, or none of them
    async fn commit(&self, ops: Vec<TxnOp>) -> Result<()>;
}

/// Parent path of a node (`/a/b` -> `/a`, `/a` -> `/`)
#[must_use]
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a child name onto a node path
#[must_use]
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
