//! Service topology discovery and watch loops
//!
//! Each service gets one cluster watch (instance membership) and each
//! instance one liveness watch (its `online` leaf). Watches are single-fire,
//! so every loop re-arms after handling a notification. A watch dropped
//! with the session re-arms once a new session is up.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use futures::future::join_all;

use super::{
    Configurator, SERVICES_ROOT, ServiceRegistryEntry, cluster_path, online_path,
};
use crate::coordination::Watch;
use crate::{Error, Result};

impl Configurator {
    /// Discover every service under `/system/services` and watch it
    ///
    /// A service that fails to load is logged and skipped; new services
    /// appearing later are picked up by a watch on the services root.
    /// Safe to call again, e.g. once this instance created the root itself.
    ///
    /// # Errors
    ///
    /// Returns error if the service list itself cannot be read
    pub async fn sync_services(&self) -> Result<()> {
        let (services, watch) = match self.get_children_watched(SERVICES_ROOT).await {
            Ok(listing) => listing,
            Err(Error::NoNode(_)) => {
                tracing::warn!(path = SERVICES_ROOT, "no services registered yet");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(error_id = e.error_id(), error = %e, "failed to list services");
                return Err(e);
            }
        };

        self.discover_new_services(&services).await;
        tracing::info!(count = services.len(), "service topology discovered");

        if !self.inner.services_watched.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            tokio::spawn(async move { this.services_loop(watch).await });
        }
        Ok(())
    }

    async fn discover_new_services(&self, services: &[String]) {
        let fresh: Vec<String> = {
            let mut known = self.inner.services.lock().unwrap_or_else(|e| e.into_inner());
            services
                .iter()
                .filter(|s| known.insert((*s).clone()))
                .cloned()
                .collect()
        };

        let results = join_all(fresh.iter().map(|s| self.discover_service(s))).await;
        for (service, result) in fresh.iter().zip(results) {
            if let Err(e) = result {
                self.forget_service(service);
                tracing::warn!(
                    service = %service,
                    error_id = e.error_id(),
                    error = %e,
                    "skipping service"
                );
            }
        }
    }

    async fn services_loop(&self, mut watch: Watch) {
        loop {
            // A dropped watch only means the session went away; relist anyway
            let _ = watch.await;
            loop {
                match self.get_children_watched(SERVICES_ROOT).await {
                    Ok((services, next)) => {
                        self.discover_new_services(&services).await;
                        watch = next;
                        break;
                    }
                    Err(Error::NoNode(_)) => {
                        self.inner.services_watched.store(false, Ordering::SeqCst);
                        tracing::warn!(path = SERVICES_ROOT, "services root removed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error_id = e.error_id(), error = %e, "failed to re-arm services watch");
                        tokio::time::sleep(self.inner.options.watch_retry).await;
                    }
                }
            }
        }
    }

    fn forget_service(&self, service: &str) {
        self.inner
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service);
    }

    /// Load one service's cluster and start watching it
    async fn discover_service(&self, service: &str) -> Result<()> {
        let cluster = cluster_path(service);
        let (instances, watch) = self.get_children_watched(&cluster).await?;
        self.reconcile_cluster(service, &instances).await;

        let this = self.clone();
        let service = service.to_string();
        tokio::spawn(async move { this.cluster_loop(service, cluster, watch).await });
        Ok(())
    }

    /// Bring a service's registry in line with its current instance list
    ///
    /// Entries for vanished instances are dropped; new instances get a
    /// liveness watch.
    async fn reconcile_cluster(&self, service: &str, instances: &[String]) {
        let mut dropped = 0;
        self.update(|s| {
            dropped = s.retain_service_entries(service, instances);
            dropped > 0
        });
        if dropped > 0 {
            tracing::info!(service, dropped, "removed departed instances");
        }

        for uuid in instances {
            let path = online_path(service, uuid);
            if !self.claim_liveness(&path) {
                continue;
            }
            if let Err(e) = self.arm_liveness(service, uuid, path.clone()).await {
                self.release_liveness(&path);
                tracing::warn!(
                    service,
                    uuid = %uuid,
                    error_id = e.error_id(),
                    error = %e,
                    "skipping instance"
                );
            }
        }
    }

    async fn cluster_loop(&self, service: String, cluster: String, mut watch: Watch) {
        loop {
            let _ = watch.await;
            loop {
                match self.get_children_watched(&cluster).await {
                    Ok((instances, next)) => {
                        self.reconcile_cluster(&service, &instances).await;
                        watch = next;
                        break;
                    }
                    Err(Error::NoNode(_)) => {
                        self.update(|s| s.retain_service_entries(&service, &[]) > 0);
                        self.forget_service(&service);
                        tracing::info!(service = %service, "service cluster removed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            service = %service,
                            error_id = e.error_id(),
                            error = %e,
                            "failed to re-arm cluster watch"
                        );
                        tokio::time::sleep(self.inner.options.watch_retry).await;
                    }
                }
            }
        }
    }

    /// Returns `false` if a liveness loop already runs for `path`
    fn claim_liveness(&self, path: &str) -> bool {
        self.inner
            .liveness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string())
    }

    fn release_liveness(&self, path: &str) {
        self.inner
            .liveness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Read an instance's liveness leaf, record it, and keep watching it
    async fn arm_liveness(&self, service: &str, uuid: &str, path: String) -> Result<()> {
        let (online, watch) = self.get_data_watched(&path).await?;
        self.record_liveness(service, uuid, &online);

        let this = self.clone();
        let service = service.to_string();
        let uuid = uuid.to_string();
        tokio::spawn(async move { this.liveness_loop(service, uuid, path, watch).await });
        Ok(())
    }

    async fn liveness_loop(&self, service: String, uuid: String, path: String, mut watch: Watch) {
        loop {
            match watch.await {
                Ok(event) => tracing::trace!(path = %event.path, kind = ?event.kind, "liveness changed"),
                Err(_) => tracing::debug!(path = %path, "liveness watch dropped, re-arming"),
            }
            loop {
                match self.get_data_watched(&path).await {
                    Ok((online, next)) => {
                        self.record_liveness(&service, &uuid, &online);
                        watch = next;
                        break;
                    }
                    Err(Error::NoNode(_)) => {
                        // The cluster watch removes the entry itself
                        self.release_liveness(&path);
                        tracing::debug!(path = %path, "liveness leaf removed");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path,
                            error_id = e.error_id(),
                            error = %e,
                            "failed to re-arm liveness watch"
                        );
                        tokio::time::sleep(self.inner.options.watch_retry).await;
                    }
                }
            }
        }
    }

    fn record_liveness(&self, service: &str, uuid: &str, online: &str) {
        let changed = self.update(|s| {
            let entry = ServiceRegistryEntry::new(uuid, online);
            if s.service_entries(service).contains(&entry) {
                return false;
            }
            s.upsert_service_entry(service, entry);
            true
        });
        if changed {
            tracing::info!(service, uuid, online, "instance liveness updated");
        }
    }

    /// Services currently being watched
    #[must_use]
    pub fn known_services(&self) -> HashSet<String> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
