//! In-process coordination store
//!
//! Behaves like a single-server coordination service: persistent nodes,
//! single-fire data and children watches, atomic transactions and explicit
//! session lifecycle. Watches are dropped when the session expires, which
//! is what a networked client does on session loss.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use super::{
    CoordinationClient, SessionEvent, TxnOp, Watch, WatchEvent, WatchEventKind, parent_path,
};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Vec<u8>>,
    data_watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    connected: bool,
    reject_auth: bool,
    connect_attempts: usize,
}

impl State {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_data(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(watchers) = self.data_watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(WatchEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }

    fn fire_children(&mut self, path: &str) {
        if let Some(watchers) = self.child_watches.remove(path) {
            for tx in watchers {
                let _ = tx.send(WatchEvent {
                    kind: WatchEventKind::NodeChildrenChanged,
                    path: path.to_string(),
                });
            }
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>) {
        let created = self.nodes.insert(path.to_string(), data).is_none();
        if created {
            self.fire_data(path, WatchEventKind::NodeCreated);
            self.fire_children(parent_path(path));
        } else {
            self.fire_data(path, WatchEventKind::NodeDataChanged);
        }
    }

    fn check_create(&self, path: &str) -> Result<()> {
        if self.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        if !self.nodes.contains_key(parent_path(path)) {
            return Err(Error::NoNode(parent_path(path).to_string()));
        }
        Ok(())
    }
}

/// In-process coordination service
#[derive(Debug)]
pub struct MemoryCoordination {
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    /// Create an empty store containing only the root node
    #[must_use]
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert("/".to_string(), Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(state),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Write a node, creating missing ancestors; works without a session
    pub fn put(&self, path: &str, data: &str) {
        let mut state = self.lock();
        let mut ancestors = Vec::new();
        let mut cur = parent_path(path);
        while cur != "/" && !state.nodes.contains_key(cur) {
            ancestors.push(cur.to_string());
            cur = parent_path(cur);
        }
        for ancestor in ancestors.into_iter().rev() {
            state.insert(&ancestor, Vec::new());
        }
        state.insert(path, data.as_bytes().to_vec());
    }

    /// Delete a node and its subtree; works without a session
    pub fn delete(&self, path: &str) {
        let mut state = self.lock();
        let prefix = format!("{path}/");
        let doomed: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| *k == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for node in doomed.iter().rev() {
            state.nodes.remove(node);
            state.fire_data(node, WatchEventKind::NodeDeleted);
            state.fire_children(node);
        }
        if !doomed.is_empty() {
            state.fire_children(parent_path(path));
        }
    }

    /// Read a node directly; works without a session
    #[must_use]
    pub fn read(&self, path: &str) -> Option<String> {
        self.lock()
            .nodes
            .get(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    /// Drop the session and every armed watch
    pub fn expire_session(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.data_watches.clear();
            state.child_watches.clear();
        }
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    /// Make subsequent connect attempts fail authentication
    pub fn set_reject_auth(&self, reject: bool) {
        self.lock().reject_auth = reject;
    }

    /// Number of times `connect` has been called
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn connect(&self) {
        let event = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.reject_auth {
                SessionEvent::AuthFailed
            } else {
                state.connected = true;
                SessionEvent::Connected
            }
        };
        let _ = self.events.send(event);
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.live()?;
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(state.children(path))
    }

    async fn get_children_watched(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut state = self.live()?;
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((state.children(path), rx))
    }

    async fn get_data(&self, path: &str) -> Result<String> {
        let state = self.live()?;
        state
            .nodes
            .get(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn get_data_watched(&self, path: &str) -> Result<(String, Watch)> {
        let mut state = self.live()?;
        let data = state
            .nodes
            .get(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        let (tx, rx) = oneshot::channel();
        state
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok((data, rx))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.live()?.nodes.contains_key(path))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.live()?;
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        state.insert(path, data.to_vec());
        Ok(())
    }

    async fn create(&self, path: &str, data: Option<&[u8]>) -> Result<String> {
        let mut state = self.live()?;
        state.check_create(path)?;
        state.insert(path, data.map(<[u8]>::to_vec).unwrap_or_default());
        Ok(path.to_string())
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<()> {
        let mut state = self.live()?;

        // Dry run against a scratch view of the tree so a failing op
        // leaves nothing applied
        let mut scratch = State {
            nodes: state.nodes.clone(),
            ..State::default()
        };
        for op in &ops {
            let TxnOp::Create { path, data } = op;
            scratch.check_create(path)?;
            scratch
                .nodes
                .insert(path.clone(), data.clone().unwrap_or_default());
        }

        for op in ops {
            let TxnOp::Create { path, data } = op;
            state.insert(&path, data.unwrap_or_default());
        }
        Ok(())
    }
}
