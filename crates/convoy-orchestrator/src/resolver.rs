//! Start order resolution.
//!
//! The resolver performs a depth-first topological sort over the requested
//! subset of services. Dependencies outside the subset are ignored. Ties
//! keep declaration order so that the result is deterministic.

use std::collections::{HashMap, HashSet};

use crate::error::{OrchestratorError, Result};
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Computes start orders for a topology.
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'a> {
    topology: &'a Topology,
}

impl<'a> DependencyResolver<'a> {
    /// Creates a resolver over `topology`.
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    /// Returns `services` ordered so each comes after its in-subset
    /// dependencies.
    ///
    /// Fails with [`OrchestratorError::CircularDependency`] if a cycle is
    /// reachable from the subset, and never returns a partial order.
    pub fn resolve(&self, services: &[String]) -> Result<Vec<String>> {
        let subset = self.subset(services)?;

        let mut marks: HashMap<&str, Mark> =
            subset.iter().map(|name| (*name, Mark::Unvisited)).collect();
        let mut order = Vec::with_capacity(subset.len());
        let mut path = Vec::new();

        for &name in &subset {
            if marks[name] == Mark::Unvisited {
                self.visit(name, &mut marks, &mut path, &mut order)?;
            }
        }

        Ok(order)
    }

    /// Groups a resolved order into waves.
    ///
    /// Every service in a wave depends only on services in earlier waves,
    /// so the members of one wave can start concurrently.
    pub fn waves(&self, order: &[String]) -> Vec<Vec<String>> {
        let in_order: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for name in order {
            let wave = self
                .topology
                .service(name)
                .map(|svc| {
                    svc.depends_on
                        .keys()
                        .filter(|dep| in_order.contains(dep.as_str()))
                        .filter_map(|dep| level.get(dep.as_str()))
                        .map(|l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);

            level.insert(name.as_str(), wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(name.clone());
        }

        waves
    }

    /// Returns `services` plus their transitive dependencies, in
    /// declaration order. Dependencies on inactive services are dropped.
    pub fn with_dependencies(&self, services: &[String]) -> Result<Vec<String>> {
        let mut wanted: HashSet<String> = HashSet::new();
        let mut pending: Vec<String> = services.to_vec();

        while let Some(name) = pending.pop() {
            let service = self
                .topology
                .service(&name)
                .ok_or_else(|| OrchestratorError::service_not_found(&name))?;
            if wanted.insert(name) {
                pending.extend(
                    service
                        .depends_on
                        .keys()
                        .filter(|dep| self.topology.service(dep).is_some())
                        .cloned(),
                );
            }
        }

        Ok(self
            .topology
            .services
            .keys()
            .filter(|name| wanted.contains(*name))
            .cloned()
            .collect())
    }

    /// Returns the services that directly or transitively depend on
    /// `service`, within `order`.
    pub fn dependents(&self, service: &str, order: &[String]) -> Vec<String> {
        let mut affected: HashSet<&str> = HashSet::from([service]);
        let mut result = Vec::new();

        // `order` is topological, so one forward pass reaches every dependent.
        for name in order {
            let depends = self
                .topology
                .service(name)
                .is_some_and(|svc| svc.depends_on.keys().any(|d| affected.contains(d.as_str())));
            if depends && affected.insert(name.as_str()) {
                result.push(name.clone());
            }
        }

        result
    }

    /// Validates the requested names and returns them in declaration order.
    fn subset(&self, services: &[String]) -> Result<Vec<&'a str>> {
        let requested: HashSet<&str> = services.iter().map(String::as_str).collect();
        for name in &requested {
            if self.topology.service(name).is_none() {
                return Err(OrchestratorError::service_not_found(*name));
            }
        }

        Ok(self
            .topology
            .services
            .keys()
            .map(String::as_str)
            .filter(|name| requested.contains(name))
            .collect())
    }

    fn visit(
        &self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        marks.insert(name, Mark::Visiting);
        path.push(name);

        if let Some(service) = self.topology.service(name) {
            for dep in service.depends_on.keys() {
                match marks.get(dep.as_str()).copied() {
                    // Outside the subset: already satisfied.
                    None => continue,
                    Some(Mark::Visited) => continue,
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(dep.clone());
                        return Err(OrchestratorError::circular_dependency(dep.as_str(), cycle));
                    }
                    Some(Mark::Unvisited) => {
                        self.visit(dep.as_str(), marks, path, order)?;
                    }
                }
            }
        }

        path.pop();
        marks.insert(name, Mark::Visited);
        order.push(name.to_string());
        Ok(())
    }
}
