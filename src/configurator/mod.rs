//! Service registry and configuration synchronizer
//!
//! The `Configurator` owns the coordination session and a local
//! [`ConfigSnapshot`] that mirrors the parts of the coordination tree a node
//! needs:
//!
//! ```text
//! /system/<server>/<field>                      -> <server>.<field>
//! /system/services/<name>/cluster/<uuid>/online -> services.<name>[{uuid, online}]
//! ```
//!
//! Reads are served from the snapshot and never touch the network. Writes go
//! straight to the coordination service; the snapshot only changes when a
//! watch reports the change back.

mod discovery;
pub mod snapshot;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

pub use snapshot::{ConfigSnapshot, ServiceRegistryEntry};

use crate::config::{Config, IdentityConfig, TRANSPORT_SERVER};
use crate::coordination::{CoordinationClient, SessionEvent, TxnOp, Watch, join_path};
use crate::{Error, Result};

/// Root of all mesh configuration in the coordination tree
pub const SYSTEM_ROOT: &str = "/system";

/// Parent of every registered service
pub const SERVICES_ROOT: &str = "/system/services";

/// Snapshot section holding this instance's identity
pub const SELF_SECTION: &str = "self";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WATCH_RETRY: Duration = Duration::from_secs(3);

/// Coordination session state as seen by the configurator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ConnectedReadOnly,
    AuthFailed,
}

impl ConnectionState {
    /// Whether reads can be served
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::ConnectedReadOnly)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::ConnectedReadOnly => write!(f, "connected (read only)"),
            Self::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

/// Tunables for a [`Configurator`]
#[derive(Debug, Clone)]
pub struct ConfiguratorOptions {
    /// Server sections mirrored from `/system/<name>`
    pub servers: Vec<String>,
    /// How long to wait for a session before giving up
    pub connect_timeout: Duration,
    /// Delay between attempts to re-arm a failed watch
    pub watch_retry: Duration,
}

impl Default for ConfiguratorOptions {
    fn default() -> Self {
        Self {
            servers: vec![TRANSPORT_SERVER.to_string()],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            watch_retry: DEFAULT_WATCH_RETRY,
        }
    }
}

/// Identity under which this process registers in the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub service: String,
    pub uuid: String,
    pub token: String,
    pub extra: Map<String, Value>,
}

impl InstanceIdentity {
    /// Resolve identity from configuration, falling back to the identity
    /// remembered in the snapshot and finally to freshly generated values
    #[must_use]
    pub fn resolve(config: &IdentityConfig, snapshot: &ConfigSnapshot) -> Self {
        let remembered = |field: &str| {
            let same_service = snapshot
                .get(&format!("{SELF_SECTION}.service"))
                .and_then(Value::as_str)
                == Some(config.service.as_str());
            same_service
                .then(|| snapshot.get(&format!("{SELF_SECTION}.{field}")))
                .flatten()
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };

        let uuid = config
            .uuid
            .clone()
            .or_else(|| remembered("uuid"))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let token = config
            .token
            .clone()
            .or_else(|| remembered("token"))
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        Self {
            service: config.service.clone(),
            uuid,
            token,
            extra: config.extra.clone(),
        }
    }

    /// `/system/services/<service>/cluster/<uuid>`
    #[must_use]
    pub fn cluster_path(&self) -> String {
        join_path(&cluster_path(&self.service), &self.uuid)
    }

    /// Liveness leaf of this instance
    #[must_use]
    pub fn online_path(&self) -> String {
        online_path(&self.service, &self.uuid)
    }
}

/// `/system/services/<service>/cluster`
#[must_use]
pub fn cluster_path(service: &str) -> String {
    format!("{SERVICES_ROOT}/{service}/cluster")
}

/// `/system/services/<service>/cluster/<uuid>/online`
#[must_use]
pub fn online_path(service: &str, uuid: &str) -> String {
    format!("{}/{uuid}/online", cluster_path(service))
}

struct Inner {
    client: Arc<dyn CoordinationClient>,
    snapshot: RwLock<ConfigSnapshot>,
    state: Mutex<ConnectionState>,
    /// Serializes connect attempts
    connect_lock: tokio::sync::Mutex<()>,
    options: ConfiguratorOptions,
    /// Services with a running cluster watch
    services: Mutex<HashSet<String>>,
    /// Whether a watch on the services root is armed
    services_watched: AtomicBool,
    /// Liveness leaves with a running watch loop
    liveness: Mutex<HashSet<String>>,
}

/// Coordination-backed configuration store
///
/// Cheap to clone; clones share the session and snapshot.
#[derive(Clone)]
pub struct Configurator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Configurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configurator")
            .field("state", &self.connection_state())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Configurator {
    /// Create a configurator over an existing snapshot
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        snapshot: ConfigSnapshot,
        options: ConfiguratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                snapshot: RwLock::new(snapshot),
                state: Mutex::new(ConnectionState::Disconnected),
                connect_lock: tokio::sync::Mutex::new(()),
                options,
                services: Mutex::new(HashSet::new()),
                services_watched: AtomicBool::new(false),
                liveness: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Create a configurator from node configuration, loading any snapshot
    /// persisted by a previous run
    ///
    /// # Errors
    ///
    /// Returns error if an existing snapshot file cannot be read
    pub fn from_config(client: Arc<dyn CoordinationClient>, config: &Config) -> Result<Self> {
        let snapshot = ConfigSnapshot::load(&config.snapshot_path)?;
        let options = ConfiguratorOptions {
            servers: config.servers.clone(),
            connect_timeout: config.coordination.connect_timeout,
            ..ConfiguratorOptions::default()
        };
        Ok(Self::new(client, snapshot, options))
    }

    /// Connect, mirror server sections, and discover the service topology
    ///
    /// Partial progress already written to the snapshot is kept on failure.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established or a server
    /// section cannot be read
    pub async fn init(&self) -> Result<()> {
        self.spawn_session_monitor();
        self.ensure_connected().await?;

        for server in &self.inner.options.servers {
            self.sync_server(server).await?;
        }

        self.sync_services().await
    }

    /// Current session state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        let state = *self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_connected() && !self.inner.client.is_connected() {
            ConnectionState::Disconnected
        } else {
            state
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Make sure a session is established before talking to the service
    ///
    /// Concurrent callers share a single connect attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthFailed` if credentials are rejected, or
    /// `Error::Coordination` if no session is established in time
    pub async fn ensure_connected(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        if self.inner.client.is_connected() {
            if !self.connection_state().is_connected() {
                self.set_state(ConnectionState::Connected);
            }
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let mut events = self.inner.client.subscribe();
        self.inner.client.connect();

        let outcome = tokio::time::timeout(self.inner.options.connect_timeout, async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Connected) => return Ok(ConnectionState::Connected),
                    Ok(SessionEvent::ConnectedReadOnly) => {
                        return Ok(ConnectionState::ConnectedReadOnly);
                    }
                    Ok(SessionEvent::AuthFailed) => return Err(Error::AuthFailed),
                    Ok(SessionEvent::Disconnected) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        return Err(Error::Coordination(
                            "session event stream closed".to_string(),
                        ));
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(state)) => {
                self.set_state(state);
                tracing::info!(%state, "coordination session established");
                Ok(())
            }
            Ok(Err(e)) => {
                let state = if matches!(e, Error::AuthFailed) {
                    ConnectionState::AuthFailed
                } else {
                    ConnectionState::Disconnected
                };
                self.set_state(state);
                tracing::error!(error_id = e.error_id(), error = %e, "coordination connect failed");
                Err(e)
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                let e = Error::Coordination(format!(
                    "no session after {}s",
                    self.inner.options.connect_timeout.as_secs()
                ));
                tracing::error!(error_id = e.error_id(), error = %e, "coordination connect failed");
                Err(e)
            }
        }
    }

    /// Follow session events so state reflects connection loss
    fn spawn_session_monitor(&self) {
        let mut events = self.inner.client.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected) => {
                        tracing::warn!("coordination session lost");
                        // A watch loop may already have reconnected
                        if !this.inner.client.is_connected() {
                            this.set_state(ConnectionState::Disconnected);
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // --- coordination operations, each guarded by ensure_connected ---

    pub(crate) async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        self.inner.client.get_children(path).await
    }

    pub(crate) async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.ensure_connected().await?;
        self.inner.client.get_children_watched(path).await
    }

    pub(crate) async fn get_data(&self, path: &str) -> Result<String> {
        self.ensure_connected().await?;
        self.inner.client.get_data(path).await
    }

    pub(crate) async fn get_data_watched(&self, path: &str) -> Result<(String, Watch)> {
        self.ensure_connected().await?;
        self.inner.client.get_data_watched(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ensure_connected().await?;
        self.inner.client.exists(path).await
    }

    /// Overwrite a node in the coordination service
    ///
    /// The local snapshot is not updated here; a watch on the node reports
    /// the change back.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the node does not exist
    pub async fn set_config_node(&self, path: &str, data: &str) -> Result<()> {
        self.ensure_connected().await?;
        self.inner
            .client
            .set_data(path, data.as_bytes())
            .await
            .inspect_err(|e| {
                tracing::error!(error_id = 202_003, error = %e, path, "failed to set node");
            })
    }

    /// Create a node in the coordination service, returning its path
    ///
    /// # Errors
    ///
    /// Returns error if not connected, the parent is missing, or the node exists
    pub async fn create_config_node(&self, path: &str, data: Option<&str>) -> Result<String> {
        self.ensure_connected().await?;
        self.inner
            .client
            .create(path, data.map(str::as_bytes))
            .await
            .inspect_err(|e| {
                tracing::error!(error_id = e.error_id(), error = %e, path, "failed to create node");
            })
    }

    // --- snapshot reads ---

    fn read(&self) -> RwLockReadGuard<'_, ConfigSnapshot> {
        self.inner.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConfigSnapshot> {
        self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a mutation to the snapshot, persisting it if `f` reports a change
    pub(crate) fn update(&self, f: impl FnOnce(&mut ConfigSnapshot) -> bool) -> bool {
        let mut snapshot = self.write();
        let changed = f(&mut snapshot);
        if changed {
            if let Err(e) = snapshot.persist() {
                tracing::error!(error = %e, "failed to persist snapshot");
            }
        }
        changed
    }

    /// Look up a dotted path in the local snapshot
    #[must_use]
    pub fn get_config_value(&self, dotted: &str) -> Option<Value> {
        self.read().get(dotted).cloned()
    }

    /// Pick the uuid of a random online instance from the entries at `dotted`
    ///
    /// Returns `None` when the path is missing, is not a list of entries, or
    /// no entry is online.
    #[must_use]
    pub fn get_config_value_random(&self, dotted: &str) -> Option<String> {
        let snapshot = self.read();
        let online: Vec<&str> = snapshot
            .get(dotted)?
            .as_array()?
            .iter()
            .filter(|entry| entry.get("online").and_then(Value::as_str) == Some("true"))
            .filter_map(|entry| entry.get("uuid").and_then(Value::as_str))
            .collect();
        online
            .choose(&mut rand::thread_rng())
            .map(|uuid| (*uuid).to_string())
    }

    /// Registry entries currently known for a service
    #[must_use]
    pub fn service_entries(&self, service: &str) -> Vec<ServiceRegistryEntry> {
        self.read().service_entries(service)
    }

    /// Copy of the whole snapshot tree
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.read().to_value()
    }

    /// Call timeout published in the transport server section, if any
    #[must_use]
    pub fn message_timeout(&self) -> Option<Duration> {
        let value = self.get_config_value(&format!("{TRANSPORT_SERVER}.message_timeout"))?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Duration::from_secs)
    }

    // --- server sections ---

    /// Mirror every leaf under `/system/<name>` into the `<name>` section
    ///
    /// Integer-looking values are stored as numbers.
    ///
    /// # Errors
    ///
    /// Returns error if the section or any of its leaves cannot be read
    pub async fn sync_server(&self, name: &str) -> Result<()> {
        let base = join_path(SYSTEM_ROOT, name);
        let fields = self.get_children(&base).await.inspect_err(|e| {
            tracing::error!(error_id = e.error_id(), error = %e, path = %base, "failed to list server section");
        })?;

        let mut section = Map::new();
        for field in fields {
            let path = join_path(&base, &field);
            let data = self.get_data(&path).await.inspect_err(|e| {
                tracing::error!(error_id = e.error_id(), error = %e, path = %path, "failed to read server field");
            })?;
            section.insert(field, leaf_value(&data));
        }

        tracing::debug!(server = name, fields = section.len(), "server section synced");
        let mut snapshot = self.write();
        snapshot.set_section(name, Value::Object(section));
        snapshot.persist()
    }

    // --- instance registration ---

    /// Resolve this instance's identity against the remembered one
    #[must_use]
    pub fn resolve_identity(&self, config: &IdentityConfig) -> InstanceIdentity {
        InstanceIdentity::resolve(config, &self.read())
    }

    /// Remember this instance's identity in the snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be persisted
    pub fn remember_identity(&self, identity: &InstanceIdentity) -> Result<()> {
        let mut snapshot = self.write();
        snapshot.set_section(
            SELF_SECTION,
            serde_json::json!({
                "service": identity.service,
                "uuid": identity.uuid,
                "token": identity.token,
                "path": identity.cluster_path(),
            }),
        );
        snapshot.persist()
    }

    /// Publish this instance under its service's cluster node
    ///
    /// Creates `uuid`, `token`, `online = "false"` and one leaf per extra
    /// metadata key in a single transaction, together with any missing
    /// parents. Returns `false` if the instance was already registered.
    ///
    /// # Errors
    ///
    /// Returns error if not connected or the transaction fails
    pub async fn register_instance(&self, identity: &InstanceIdentity) -> Result<bool> {
        let base = identity.cluster_path();
        if self.exists(&base).await? {
            tracing::debug!(path = %base, "instance already registered");
            return Ok(false);
        }

        let mut ops = Vec::new();
        let service_path = join_path(SERVICES_ROOT, &identity.service);
        let cluster = cluster_path(&identity.service);
        for ancestor in [SYSTEM_ROOT, SERVICES_ROOT, service_path.as_str(), cluster.as_str()] {
            if !self.exists(ancestor).await? {
                ops.push(TxnOp::create(ancestor, None));
            }
        }

        ops.push(TxnOp::create(base.clone(), None));
        ops.push(TxnOp::create(join_path(&base, "uuid"), Some(&identity.uuid)));
        ops.push(TxnOp::create(join_path(&base, "token"), Some(&identity.token)));
        ops.push(TxnOp::create(identity.online_path(), Some("false")));
        for (key, value) in &identity.extra {
            ops.push(TxnOp::create(
                join_path(&base, key),
                Some(&value.to_string()),
            ));
        }

        self.ensure_connected().await?;
        self.inner.client.commit(ops).await.inspect_err(|e| {
            tracing::error!(error_id = 202_004, error = %e, path = %base, "instance registration failed");
        })?;

        tracing::info!(path = %base, "instance registered");
        Ok(true)
    }

    /// Flip this instance's liveness leaf
    ///
    /// # Errors
    ///
    /// Returns error if the leaf cannot be written
    pub async fn set_online(&self, identity: &InstanceIdentity, online: bool) -> Result<()> {
        self.set_config_node(&identity.online_path(), if online { "true" } else { "false" })
            .await
    }
}

/// Interpret a leaf's text: integers become numbers, everything else a string
fn leaf_value(data: &str) -> Value {
    data.trim()
        .parse::<i64>()
        .map_or_else(|_| Value::String(data.to_string()), Value::from)
}
