//! Mesh node - per-process bootstrap and transport event loop
//!
//! Startup: sync configuration, resolve identity, register the instance,
//! build its [`VirtualDevice`]. Running: drive transport events, publishing
//! liveness as the connection comes and goes.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::config::Config;
use crate::configurator::{Configurator, InstanceIdentity};
use crate::coordination::CoordinationClient;
use crate::rpc::{CommandRegistry, VirtualDevice};
use crate::transport::{Transport, TransportEvent};
use crate::{Error, Result};

/// One running mesh instance
pub struct Node {
    config: Config,
    identity: InstanceIdentity,
    configurator: Configurator,
    transport: Arc<dyn Transport>,
    device: VirtualDevice,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Bring an instance up to the point where it can connect
    ///
    /// `transport_for` builds the transport once the instance's uuid is known.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, or if configuration
    /// sync or instance registration fails
    pub async fn start<F>(
        config: Config,
        client: Arc<dyn CoordinationClient>,
        commands: CommandRegistry,
        transport_for: F,
    ) -> Result<Self>
    where
        F: FnOnce(&InstanceIdentity) -> Arc<dyn Transport>,
    {
        config.validate()?;
        tracing::info!(
            coordination = %config.coordination.connect_string(),
            servers = ?config.servers,
            snapshot = %config.snapshot_path.display(),
            "starting node"
        );
        let configurator = Configurator::from_config(client, &config)?;
        configurator.init().await?;

        let identity = configurator.resolve_identity(&config.identity);
        configurator.remember_identity(&identity)?;
        configurator.register_instance(&identity).await?;

        // Registration may have created the services root
        configurator.sync_services().await?;

        let transport = transport_for(&identity);
        let device = VirtualDevice::new(
            identity.uuid.clone(),
            Arc::clone(&transport),
            configurator.clone(),
            commands,
            config.rpc.message_timeout,
        );

        tracing::info!(
            service = %identity.service,
            uuid = %identity.uuid,
            transport = transport.name(),
            commands = ?device.commands(),
            "node started"
        );

        Ok(Self {
            config,
            identity,
            configurator,
            transport,
            device,
        })
    }

    #[must_use]
    pub const fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn configurator(&self) -> &Configurator {
        &self.configurator
    }

    #[must_use]
    pub const fn device(&self) -> &VirtualDevice {
        &self.device
    }

    /// Run until `shutdown` resolves
    ///
    /// Transport errors and disconnects mark the instance offline and
    /// reconnect after the configured delay. On shutdown the instance is
    /// marked offline and the transport closed.
    ///
    /// # Errors
    ///
    /// Returns error if the transport event stream closes unexpectedly
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let stats_task = self
            .device
            .spawn_stats_refresh(self.config.rpc.stats_interval);
        let mut events = self.transport.subscribe();
        let mut reconnect_at = None;

        if let Err(e) = self.transport.connect().await {
            reconnect_at = Some(self.connection_lost(201_002, &e.to_string()).await);
        }

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                () = sleep_until(reconnect_at) => {
                    reconnect_at = None;
                    tracing::info!(transport = self.transport.name(), "reconnecting");
                    if let Err(e) = self.transport.connect().await {
                        reconnect_at = Some(self.connection_lost(201_002, &e.to_string()).await);
                    }
                }
                event = events.recv() => match event {
                    Ok(TransportEvent::Ready) => self.connection_ready().await,
                    Ok(TransportEvent::Message(raw)) => self.device.on_message(raw).await,
                    Ok(TransportEvent::Error(reason)) => {
                        reconnect_at = Some(self.connection_lost(201_002, &reason).await);
                    }
                    Ok(TransportEvent::Disconnected) => {
                        reconnect_at = Some(self.connection_lost(201_003, "disconnected").await);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "transport events lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        break Err(Error::Transport("event stream closed".to_string()));
                    }
                },
            }
        };

        stats_task.abort();
        if let Err(e) = self.configurator.set_online(&self.identity, false).await {
            tracing::warn!(error_id = e.error_id(), error = %e, "failed to mark instance offline");
        }
        if let Err(e) = self.transport.disconnect().await {
            tracing::warn!(error = %e, "transport disconnect failed");
        }
        tracing::info!(uuid = %self.identity.uuid, "node stopped");
        outcome
    }

    async fn connection_ready(&self) {
        tracing::info!(
            service = %self.identity.service,
            uuid = %self.identity.uuid,
            "connected to transport"
        );
        if let Err(e) = self.configurator.set_online(&self.identity, true).await {
            tracing::error!(error_id = e.error_id(), error = %e, "failed to mark instance online");
        }
    }

    /// Mark offline and return when to reconnect
    async fn connection_lost(&self, error_id: u32, reason: &str) -> Instant {
        if let Err(e) = self.configurator.set_online(&self.identity, false).await {
            tracing::error!(error_id = e.error_id(), error = %e, "failed to mark instance offline");
        }
        let delay = self.config.reconnect_delay;
        tracing::error!(
            error_id,
            uuid = %self.identity.uuid,
            reason,
            retry_secs = delay.as_secs(),
            "transport connection lost"
        );
        Instant::now() + delay
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
