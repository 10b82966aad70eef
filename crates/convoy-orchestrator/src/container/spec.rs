//! Container image references and resource limits.

use serde::{Deserialize, Serialize};

/// Container image reference.
///
/// Serialized as the plain reference string (`registry/repository:tag@digest`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerImage {
    reference: String,
}

impl ContainerImage {
    /// Creates a new container image from a reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use convoy_orchestrator::container::ContainerImage;
    ///
    /// let image = ContainerImage::new("redis:7-alpine");
    /// assert_eq!(image.reference(), "redis:7-alpine");
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    /// Returns the full image reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the image name (without tag or digest).
    pub fn name(&self) -> &str {
        let without_digest = self.without_digest();
        match self.tag_separator() {
            Some(idx) => &without_digest[..idx],
            None => without_digest,
        }
    }

    /// Returns the image tag if present.
    pub fn tag(&self) -> Option<&str> {
        let without_digest = self.without_digest();
        self.tag_separator().map(|idx| &without_digest[idx + 1..])
    }

    /// Returns the image digest if present.
    pub fn digest(&self) -> Option<&str> {
        self.reference.split_once('@').map(|(_, digest)| digest)
    }

    /// Returns the reference split into `(name, tag)` for a pull request,
    /// defaulting the tag to `latest`.
    pub fn pull_parts(&self) -> (&str, &str) {
        match self.digest() {
            Some(digest) => (self.name(), digest),
            None => (self.name(), self.tag().unwrap_or("latest")),
        }
    }

    fn without_digest(&self) -> &str {
        self.reference
            .split_once('@')
            .map(|(name, _)| name)
            .unwrap_or(&self.reference)
    }

    // The tag colon is the last one after the final path separator, so a
    // registry port (`host:5000/app`) is not mistaken for a tag.
    fn tag_separator(&self) -> Option<usize> {
        let without_digest = self.without_digest();
        let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
        without_digest[last_slash..]
            .rfind(':')
            .map(|idx| idx + last_slash)
    }
}

impl From<&str> for ContainerImage {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContainerImage {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePullPolicy {
    /// Always pull the image.
    Always,

    /// Pull if not present locally.
    #[default]
    #[serde(alias = "if_not_present")]
    Missing,

    /// Never pull (image must be present).
    Never,
}

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU limit in millicores (1000 = 1 CPU).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u32>,

    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,

    /// Memory reservation (soft limit) in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation_bytes: Option<u64>,

    /// Process limit (pids).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

impl ResourceLimits {
    /// Creates a new resource limits builder.
    pub fn builder() -> ResourceLimitsBuilder {
        ResourceLimitsBuilder::default()
    }

    /// Creates resource limits with CPU and memory limits.
    pub fn new(cpu_millicores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_millicores: Some(cpu_millicores),
            memory_bytes: Some(memory_mb * 1024 * 1024),
            ..Default::default()
        }
    }

    /// Returns true if no limit is set.
    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }

    /// Returns the CPU limit as a fraction (e.g., 0.5 for 500m).
    pub fn cpu_limit(&self) -> Option<f64> {
        self.cpu_millicores.map(|m| m as f64 / 1000.0)
    }

    /// Returns the NanoCPUs value for the Docker API.
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu_millicores.map(|m| (m as i64) * 1_000_000)
    }
}

/// Builder for `ResourceLimits`.
#[derive(Debug, Default)]
pub struct ResourceLimitsBuilder {
    limits: ResourceLimits,
}

impl ResourceLimitsBuilder {
    /// Sets the CPU limit as a fraction (e.g., 0.5 for half a CPU).
    pub fn cpu(mut self, cpus: f64) -> Self {
        self.limits.cpu_millicores = Some((cpus * 1000.0) as u32);
        self
    }

    /// Sets the memory limit in megabytes.
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.limits.memory_bytes = Some(mb * 1024 * 1024);
        self
    }

    /// Sets the process limit.
    pub fn pids_limit(mut self, limit: i64) -> Self {
        self.limits.pids_limit = Some(limit);
        self
    }

    /// Builds the resource limits.
    pub fn build(self) -> ResourceLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_image_parsing() {
        let image = ContainerImage::new("redis:7-alpine");
        assert_eq!(image.name(), "redis");
        assert_eq!(image.tag(), Some("7-alpine"));
        assert_eq!(image.digest(), None);
        assert_eq!(image.pull_parts(), ("redis", "7-alpine"));
    }

    #[test]
    fn test_container_image_with_registry_port() {
        let image = ContainerImage::new("localhost:5000/shop/api");
        assert_eq!(image.name(), "localhost:5000/shop/api");
        assert_eq!(image.tag(), None);
        assert_eq!(image.pull_parts(), ("localhost:5000/shop/api", "latest"));
    }

    #[test]
    fn test_container_image_with_digest() {
        let image = ContainerImage::new("redis@sha256:abc123");
        assert_eq!(image.name(), "redis");
        assert_eq!(image.tag(), None);
        assert_eq!(image.digest(), Some("sha256:abc123"));
    }

    #[test]
    fn test_container_image_serializes_as_string() {
        let image: ContainerImage = serde_yaml::from_str("postgres:16").unwrap();
        assert_eq!(image.reference(), "postgres:16");
        assert_eq!(serde_json::to_string(&image).unwrap(), "\"postgres:16\"");
    }

    #[test]
    fn test_resource_limits_builder() {
        let limits = ResourceLimits::builder()
            .cpu(0.5)
            .memory_mb(512)
            .pids_limit(100)
            .build();

        assert_eq!(limits.cpu_millicores, Some(500));
        assert_eq!(limits.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(limits.pids_limit, Some(100));
        assert_eq!(limits.nano_cpus(), Some(500_000_000));
        assert!(!limits.is_unlimited());
        assert!(ResourceLimits::default().is_unlimited());
    }
}
