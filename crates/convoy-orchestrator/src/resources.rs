//! Network and volume lifecycle.
//!
//! Creation converges on the declared state: a resource that already exists
//! is accepted with a warning, and resources created earlier by the same
//! manager are not requested again. External resources are never touched.

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::runtime::{NetworkRequest, SharedRuntime, VolumeRequest, LABEL_PROJECT};
use crate::topology::{NetworkSpec, Topology, VolumeSpec};

/// Creates and removes the networks and volumes of one project.
#[derive(Clone)]
pub struct ResourceManager {
    runtime: SharedRuntime,
    project: String,
    labels: IndexMap<String, String>,
    networks: IndexMap<String, NetworkSpec>,
    volumes: IndexMap<String, VolumeSpec>,
    /// Runtime names known to exist.
    ready: Arc<Mutex<HashSet<String>>>,
}

impl ResourceManager {
    /// Creates a manager for the networks and volumes of `topology`.
    pub fn new(
        runtime: SharedRuntime,
        topology: &Topology,
        project: impl Into<String>,
        labels: IndexMap<String, String>,
    ) -> Self {
        Self {
            runtime,
            project: project.into(),
            labels,
            networks: topology.effective_networks(),
            volumes: topology.volumes.clone(),
            ready: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Makes sure every managed network exists. Returns the runtime names.
    pub async fn ensure_networks(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for spec in self.networks.values().filter(|n| !n.external) {
            let name = spec.scoped_name(&self.project);
            if self.is_ready(&name).await {
                names.push(name);
                continue;
            }

            let request = NetworkRequest {
                name: name.clone(),
                driver: spec.driver.clone(),
                driver_opts: spec.driver_opts.clone(),
                internal: spec.internal,
                enable_ipv6: spec.enable_ipv6,
                labels: self.labels_with(&spec.labels),
            };

            match self.runtime.create_network(&request).await {
                Ok(id) => info!(network = %name, id = %id, "Created network"),
                Err(err) if err.is_already_exists() => {
                    warn!(network = %name, "Network already exists, reusing it")
                }
                Err(err) => return Err(err.into()),
            }

            self.ready.lock().await.insert(name.clone());
            names.push(name);
        }

        Ok(names)
    }

    /// Makes sure every managed volume exists. Returns the runtime names.
    pub async fn ensure_volumes(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for spec in self.volumes.values().filter(|v| !v.external) {
            let name = spec.scoped_name(&self.project);
            if self.is_ready(&name).await {
                names.push(name);
                continue;
            }

            let request = VolumeRequest {
                name: name.clone(),
                driver: spec.driver.clone(),
                driver_opts: spec.driver_opts.clone(),
                labels: self.labels_with(&spec.labels),
            };

            match self.runtime.create_volume(&request).await {
                Ok(_) => info!(volume = %name, "Created volume"),
                Err(err) if err.is_already_exists() => {
                    warn!(volume = %name, "Volume already exists, reusing it")
                }
                Err(err) => return Err(err.into()),
            }

            self.ready.lock().await.insert(name.clone());
            names.push(name);
        }

        Ok(names)
    }

    /// Removes every managed network.
    ///
    /// Returns the removed names and the failures. Missing networks are
    /// skipped, and removal continues past failures.
    pub async fn remove_networks(&self) -> (Vec<String>, Vec<OrchestratorError>) {
        let names: Vec<String> = self
            .networks
            .values()
            .filter(|n| !n.external)
            .map(|n| n.scoped_name(&self.project))
            .collect();

        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for name in names.into_iter().rev() {
            match self.runtime.remove_network(&name).await {
                Ok(()) => {
                    info!(network = %name, "Removed network");
                    removed.push(name.clone());
                }
                Err(err) if err.is_not_found() => debug!(network = %name, "Network already gone"),
                Err(err) => {
                    warn!(network = %name, error = %err, "Failed to remove network");
                    errors.push(err.into());
                    continue;
                }
            }
            self.ready.lock().await.remove(&name);
        }
        (removed, errors)
    }

    /// Removes every managed volume, collecting failures like
    /// [`remove_networks`](Self::remove_networks).
    pub async fn remove_volumes(&self) -> (Vec<String>, Vec<OrchestratorError>) {
        let names: Vec<String> = self
            .volumes
            .values()
            .filter(|v| !v.external)
            .map(|v| v.scoped_name(&self.project))
            .collect();

        let mut removed = Vec::new();
        let mut errors = Vec::new();
        for name in names.into_iter().rev() {
            match self.runtime.remove_volume(&name).await {
                Ok(()) => {
                    info!(volume = %name, "Removed volume");
                    removed.push(name.clone());
                }
                Err(err) if err.is_not_found() => debug!(volume = %name, "Volume already gone"),
                Err(err) => {
                    warn!(volume = %name, error = %err, "Failed to remove volume");
                    errors.push(err.into());
                    continue;
                }
            }
            self.ready.lock().await.remove(&name);
        }
        (removed, errors)
    }

    async fn is_ready(&self, name: &str) -> bool {
        self.ready.lock().await.contains(name)
    }

    fn labels_with(&self, own: &IndexMap<String, String>) -> IndexMap<String, String> {
        let mut labels = IndexMap::new();
        labels.insert(LABEL_PROJECT.to_string(), self.project.clone());
        labels.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels
    }
}
