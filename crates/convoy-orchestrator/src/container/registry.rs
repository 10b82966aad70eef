//! In-memory registry of the containers started by one orchestrator.
//!
//! The runtime is the source of truth for process state; the registry is a
//! cache that the lifecycle manager writes and the readiness coordinator and
//! health monitors read. Each orchestrator owns its own registry.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::container::instance::{ContainerInstance, ContainerStatus, HealthState};
use crate::error::{OrchestratorError, Result};

/// Shared, cloneable container registry keyed by container ID.
#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    containers: Arc<RwLock<HashMap<String, ContainerInstance>>>,
}

impl ContainerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container, replacing any entry with the same ID.
    pub async fn register(&self, instance: ContainerInstance) {
        let mut containers = self.containers.write().await;
        containers.insert(instance.id.clone(), instance);
    }

    /// Unregisters a container.
    pub async fn unregister(&self, id: &str) -> Option<ContainerInstance> {
        let mut containers = self.containers.write().await;
        containers.remove(id)
    }

    /// Gets a container by ID.
    pub async fn get(&self, id: &str) -> Option<ContainerInstance> {
        let containers = self.containers.read().await;
        containers.get(id).cloned()
    }

    /// Gets a container by name.
    pub async fn get_by_name(&self, name: &str) -> Option<ContainerInstance> {
        let containers = self.containers.read().await;
        containers.values().find(|c| c.name == name).cloned()
    }

    /// Returns true if the container is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.containers.read().await.contains_key(id)
    }

    /// Gets all containers, ordered by service then replica.
    pub async fn all(&self) -> Vec<ContainerInstance> {
        let containers = self.containers.read().await;
        let mut all: Vec<_> = containers.values().cloned().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service).then(a.replica.cmp(&b.replica)));
        all
    }

    /// Gets the replicas of a service, ordered by replica index.
    pub async fn for_service(&self, service: &str) -> Vec<ContainerInstance> {
        let containers = self.containers.read().await;
        let mut replicas: Vec<_> = containers
            .values()
            .filter(|c| c.service == service)
            .cloned()
            .collect();
        replicas.sort_by_key(|c| c.replica);
        replicas
    }

    /// Updates a container's status and exit code.
    pub async fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
        exit_code: Option<i64>,
    ) -> Result<()> {
        let mut containers = self.containers.write().await;
        let instance = containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::container_not_found(id))?;

        instance.status = status;
        if exit_code.is_some() {
            instance.exit_code = exit_code;
        }
        Ok(())
    }

    /// Sets a container's health state.
    ///
    /// Returns the previous state, or an error if the container is gone.
    pub async fn set_health(&self, id: &str, health: HealthState) -> Result<Option<HealthState>> {
        let mut containers = self.containers.write().await;
        let instance = containers
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::container_not_found(id))?;

        Ok(instance.health.replace(health))
    }

    /// Merges containers discovered in the runtime into the registry.
    ///
    /// Known entries get their status refreshed; unknown ones are added.
    /// When `complete` is set the listing covers stopped containers too, so
    /// entries it does not mention were removed behind our back and are
    /// dropped. Health state is kept, since the runtime does not report it
    /// for engine-driven probes.
    pub async fn reconcile(&self, discovered: Vec<ContainerInstance>, complete: bool) {
        let mut containers = self.containers.write().await;
        if complete {
            containers.retain(|id, _| discovered.iter().any(|found| &found.id == id));
        }
        for found in discovered {
            match containers.get_mut(&found.id) {
                Some(known) => {
                    known.status = found.status;
                    if found.exit_code.is_some() {
                        known.exit_code = found.exit_code;
                    }
                }
                None => {
                    containers.insert(found.id.clone(), found);
                }
            }
        }
    }

    /// Gets the count of containers by status.
    pub async fn status_counts(&self) -> HashMap<ContainerStatus, usize> {
        let containers = self.containers.read().await;
        let mut counts = HashMap::new();
        for instance in containers.values() {
            *counts.entry(instance.status).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the number of registered containers.
    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    /// Returns true if no container is registered.
    pub async fn is_empty(&self) -> bool {
        self.containers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_register_and_update() {
        let registry = ContainerRegistry::new();
        registry
            .register(ContainerInstance::new("c1", "shop_web_1", "web", 1))
            .await;

        let retrieved = registry.get("c1").await.unwrap();
        assert_eq!(retrieved.name, "shop_web_1");

        registry
            .update_status("c1", ContainerStatus::Running, None)
            .await
            .unwrap();
        assert!(registry.get("c1").await.unwrap().is_running());

        let previous = registry.set_health("c1", HealthState::Healthy).await.unwrap();
        assert_eq!(previous, None);
        assert!(registry.get("c1").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_registry_missing_container() {
        let registry = ContainerRegistry::new();
        let err = registry
            .update_status("ghost", ContainerStatus::Stopped, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.set_health("ghost", HealthState::Healthy).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_for_service_ordering() {
        let registry = ContainerRegistry::new();
        for replica in [3, 1, 2] {
            registry
                .register(ContainerInstance::new(
                    format!("w{}", replica),
                    format!("shop_worker_{}", replica),
                    "worker",
                    replica,
                ))
                .await;
        }
        registry
            .register(ContainerInstance::new("d1", "shop_db_1", "db", 1))
            .await;

        let replicas: Vec<u32> = registry
            .for_service("worker")
            .await
            .iter()
            .map(|c| c.replica)
            .collect();
        assert_eq!(replicas, vec![1, 2, 3]);
        assert_eq!(registry.len().await, 4);
    }

    #[tokio::test]
    async fn test_registry_reconcile_keeps_health() {
        let registry = ContainerRegistry::new();
        registry
            .register(ContainerInstance::new("c1", "shop_db_1", "db", 1).mark_running())
            .await;
        registry.set_health("c1", HealthState::Healthy).await.unwrap();

        let mut exited = ContainerInstance::new("c1", "shop_db_1", "db", 1);
        exited.status = ContainerStatus::Exited;
        exited.exit_code = Some(137);
        let stray = ContainerInstance::new("c2", "shop_db_2", "db", 2);

        registry.reconcile(vec![exited, stray], false).await;

        let known = registry.get("c1").await.unwrap();
        assert_eq!(known.status, ContainerStatus::Exited);
        assert_eq!(known.exit_code, Some(137));
        assert_eq!(known.health, Some(HealthState::Healthy));
        assert!(registry.contains("c2").await);
    }

    #[tokio::test]
    async fn test_registry_complete_reconcile_drops_vanished() {
        let registry = ContainerRegistry::new();
        registry
            .register(ContainerInstance::new("c1", "shop_db_1", "db", 1).mark_running())
            .await;
        registry
            .register(ContainerInstance::new("c2", "shop_web_1", "web", 1).mark_running())
            .await;

        // A running-only listing says nothing about the missing entry.
        registry
            .reconcile(vec![ContainerInstance::new("c1", "shop_db_1", "db", 1).mark_running()], false)
            .await;
        assert!(registry.contains("c2").await);

        registry
            .reconcile(vec![ContainerInstance::new("c1", "shop_db_1", "db", 1).mark_running()], true)
            .await;
        assert!(registry.contains("c1").await);
        assert!(!registry.contains("c2").await);
    }

    #[tokio::test]
    async fn test_registry_concurrent_writes() {
        let registry = ContainerRegistry::new();
        let handles: Vec<_> = (1..=32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(ContainerInstance::new(
                            format!("id-{}", i),
                            format!("shop_web_{}", i),
                            "web",
                            i,
                        ))
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.for_service("web").await.len(), 32);
        let counts = registry.status_counts().await;
        assert_eq!(counts.get(&ContainerStatus::Created), Some(&32));
    }
}
