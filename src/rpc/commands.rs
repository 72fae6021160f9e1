//! Named command handlers
//!
//! Inbound `RPC_CALL`s are dispatched by `cmdName` through an explicit
//! registry populated when the device is built. Unknown names are rejected
//! with a `200004` reply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::message::RpcBackPayload;

/// Handler for one named command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command; failures are expressed as a non-200 reply
    async fn handle(&self, parameters: Value) -> RpcBackPayload;
}

/// Adapts an async closure into a [`CommandHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = RpcBackPayload> + Send,
{
    async fn handle(&self, parameters: Value) -> RpcBackPayload {
        (self.0)(parameters).await
    }
}

/// Command name → handler
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcBackPayload> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Builder-style [`CommandRegistry::register_fn`]
    #[must_use]
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcBackPayload> + Send + 'static,
    {
        self.register_fn(name, f);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
